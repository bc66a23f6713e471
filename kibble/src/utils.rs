/// Fixed-size on-EEPROM record layout shared by the registry and the
/// Reed-Solomon codec.
pub mod record;
