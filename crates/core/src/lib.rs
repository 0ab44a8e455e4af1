pub mod shared {
    pub mod constants;
    pub mod embedding;
    pub mod face_box;
    pub mod frame;
    pub mod model_resolver;
    pub mod onnx_session;
    pub mod settings;
}

pub mod capture {
    pub mod domain {
        pub mod frame_source;
    }
    pub mod infrastructure {
        pub mod ffmpeg_camera_source;
        pub mod image_directory_source;
    }
}

pub mod detection {
    pub mod domain {
        pub mod detection_stage;
        pub mod face_detector;
    }
    pub mod infrastructure;
}

pub mod recognition {
    pub mod domain {
        pub mod face_embedder;
        pub mod match_result;
        pub mod recognition_stage;
    }
    pub mod infrastructure {
        pub mod onnx_arcface_embedder;
    }
}

pub mod identity {
    pub mod domain {
        pub mod embedding_store;
        pub mod identity_record;
        pub mod identity_repository;
    }
    pub mod infrastructure {
        pub mod json_identity_repository;
    }
}

pub mod unknown {
    pub mod domain {
        pub mod crop_writer;
        pub mod encounter_gate;
        pub mod unknown_face_logger;
    }
    pub mod infrastructure {
        pub mod jpeg_crop_writer;
    }
}

pub mod control {
    pub mod domain {
        pub mod command;
        pub mod command_channel;
        pub mod command_dispatcher;
        pub mod decision_policy;
    }
    pub mod infrastructure {
        pub mod tcp_command_channel;
    }
}

pub mod pipeline {
    pub mod freshness_queue;
    pub mod pipeline_executor;
    pub mod pipeline_logger;
    pub mod infrastructure {
        pub mod threaded_pipeline_executor;
    }
}
