pub mod domain {
    pub mod motor;
    pub mod motor_driver;
    pub mod state_machine;
}

pub mod infrastructure {
    pub mod control_server;
    pub mod logging_motor_driver;
    pub mod sysfs_gpio_driver;
}
