/// Devices are the atomic units that can be combined together
/// into components. Their core responsibilities do not change
/// based on location, name etc.
pub mod hardware {
    /// Bridge client for the multiplexed 1-Wire bus behind the UART.
    pub mod bus_bridge;
    /// PWM driver abstraction for the solenoid/auger/servo channels.
    pub mod pwm;
    /// Reed-Solomon GF(2^8) codec protecting tank EEPROM records.
    pub mod rs_codec;
}

/// TODO: Not utilised as yet.
pub mod software {}
