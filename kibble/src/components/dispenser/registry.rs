//! Tank registry: reconciles physical bus presence with the logical set of
//! known tanks, keeps each tank's EEPROM record in sync, and is the only
//! component that touches the PWM driver - the engine and dispatcher drive
//! servos only through the methods below.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::components::dispenser::engine::HopperActuator;
use crate::devices::hardware::bus_bridge::{BusBridge, BUS_COUNT};
use crate::devices::hardware::pwm::{self, ChannelMode, PwmDriver};
use crate::devices::hardware::rs_codec::{self, CODEWORD, DATA};
use crate::error::Error;
use crate::utils::record::{TankInfo, TankRecord, NEVER_PLACED_BUS};

const RECORD_OFFSET: u16 = 0;
/// PWM channel reserved for the hopper gate servo; channels `0..=5` are
/// wired 1:1 to the six tank bus indices.
pub const HOPPER_CHANNEL: u8 = 6;
/// Full bus mask: every one of the six buses.
pub const ALL_BUSES: u8 = 0b0011_1111;
/// Half the commandable deflection of `set_continuous_servo`'s speed range,
/// in microseconds either side of a tank's calibrated neutral.
const CONTINUOUS_SPAN_US: i32 = 500;
const CONTINUOUS_DEAD_ZONE: f32 = 0.01;

pub struct TankRegistry<T, P> {
    /// Unique id of this registry instance, distinct from any tank's own
    /// bus uid, for tying reconciliation log lines back to a particular
    /// daemon run when several are compared side by side.
    uuid: Uuid,
    bridge: Arc<BusBridge<T>>,
    pwm: Arc<Mutex<P>>,
    known: Vec<TankInfo>,
    host_mac: [u8; 6],
}

impl<T, P> TankRegistry<T, P>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    P: PwmDriver,
{
    pub fn new(bridge: Arc<BusBridge<T>>, pwm: Arc<Mutex<P>>, host_mac: [u8; 6]) -> Self {
        TankRegistry { uuid: Uuid::new_v4(), bridge, pwm, known: Vec::new(), host_mac }
    }

    /// Returns the unique id of this registry instance.
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn known_tanks(&self) -> &[TankInfo] {
        &self.known
    }

    /// Shares this registry's PWM driver handle with a caller that needs to
    /// command hardware neutral without going through the registry's own
    /// outer lock - the safety supervisor's direct preemption path (spec
    /// section 4.7/5) is the only intended user.
    pub fn pwm_handle(&self) -> Arc<Mutex<P>> {
        self.pwm.clone()
    }

    /// Current per-bus UID snapshot via a roll-call, without reading any
    /// EEPROM. Cheap enough for the background scanner task to call every
    /// tick to decide whether a full [`Self::refresh`] is warranted.
    pub async fn poll_presence(&self) -> Result<[u64; BUS_COUNT], Error> {
        self.bridge.roll_call().await
    }

    fn find(&self, uid: u64) -> Option<&TankInfo> {
        self.known.iter().find(|t| t.uid == uid)
    }

    /// Runs one reconciliation pass over the buses indicated by `bus_mask`
    /// (bit `i` set means scan bus `i`; [`ALL_BUSES`] scans every bus). May
    /// only be called while the PWM driver is in [`ChannelMode::BusPower`].
    /// Returns whether the known-tanks set changed.
    pub async fn refresh(&mut self, bus_mask: u8) -> Result<bool, Error> {
        if self.pwm.lock().await.mode() != ChannelMode::BusPower {
            return Err(Error::InvalidPayload("refresh requires bus-power mode".into()));
        }

        // Phase A: scan.
        let found = if bus_mask == ALL_BUSES {
            self.bridge.roll_call().await?
        } else {
            let mut uids = [0u64; BUS_COUNT];
            for i in 0..BUS_COUNT as u8 {
                if bus_mask & (1 << i) != 0 {
                    uids[i as usize] = self.bridge.get_uid(i).await.unwrap_or(0);
                }
            }
            uids
        };
        let scanned: Vec<u8> = (0..BUS_COUNT as u8).filter(|i| bus_mask & (1 << i) != 0).collect();
        debug!("registry {}: scan covered buses {scanned:?}, found {found:?}", self.uuid);

        // Phase B: detach.
        let mut changed = false;
        for tank in self.known.iter_mut() {
            if tank.bus_index >= 0 && scanned.contains(&(tank.bus_index as u8)) {
                let still_here = found[tank.bus_index as usize] == tank.uid;
                if !still_here {
                    tank.bus_index = -1;
                    changed = true;
                }
            }
        }

        // Phase C: attach/create + integrity.
        for &bus in &scanned {
            let uid = found[bus as usize];
            if uid == 0 {
                continue;
            }
            let existing_idx = self.known.iter().position(|t| t.uid == uid);
            let idx = match existing_idx {
                Some(i) => {
                    if self.known[i].bus_index != bus as i8 {
                        changed = true;
                    }
                    self.known[i].bus_index = bus as i8;
                    i
                }
                None => {
                    self.known.push(TankInfo::witness(uid, bus as i8));
                    changed = true;
                    self.known.len() - 1
                }
            };
            if !self.known[idx].full_info {
                match self.read_and_verify(bus).await {
                    Ok(record) => self.known[idx].fill_from_record(&record),
                    Err(e) => {
                        warn!("bus {bus} uid {uid:#018x} record integrity failed ({e}), rewriting default");
                        let fresh = TankRecord::new_tank_default();
                        if let Err(write_err) = self.write_record(bus, &fresh).await {
                            warn!("bus {bus} default rewrite failed too: {write_err}");
                        }
                        self.known[idx].fill_from_record(&fresh);
                    }
                }
            }
        }

        // Phase D: garbage collect.
        let before = self.known.len();
        self.known.retain(|t| t.bus_index >= 0);
        let removed = before - self.known.len();
        if removed > 0 {
            changed = true;
            info!("registry: {removed} tank(s) detached, {} remain", self.known.len());
        }

        // Phase E: publish is the caller's responsibility (it owns the hub).
        Ok(changed)
    }

    async fn read_and_verify(&self, bus: u8) -> Result<TankRecord, Error> {
        let bytes = self.bridge.read(bus, RECORD_OFFSET, CODEWORD as u8).await?;
        if bytes.len() != CODEWORD {
            return Err(Error::InvalidPayload(format!(
                "expected {CODEWORD} record bytes, got {}",
                bytes.len()
            )));
        }
        let mut codeword = [0u8; CODEWORD];
        codeword.copy_from_slice(&bytes);
        let data = rs_codec::decode(&mut codeword)?;
        let record = TankRecord::from_bytes(&data);
        if !record.bounds_ok() {
            return Err(Error::InvalidPayload("record failed structural bounds check".into()));
        }
        Ok(record)
    }

    async fn write_record(&self, bus: u8, record: &TankRecord) -> Result<(), Error> {
        let mut data = [0u8; DATA];
        data.copy_from_slice(&record.to_bytes());
        let codeword = rs_codec::encode(&data);
        self.bridge.write(bus, RECORD_OFFSET, &codeword).await
    }

    /// Re-reads the EEPROM for `uid`, returning an error if it is not
    /// currently present on any bus.
    pub async fn refresh_tank_info(&mut self, uid: u64) -> Result<TankInfo, Error> {
        let bus = self
            .find(uid)
            .filter(|t| t.bus_index >= 0)
            .map(|t| t.bus_index as u8)
            .ok_or(Error::TankUnavailable(0xFF))?;
        let record = self.read_and_verify(bus).await?;
        let idx = self.known.iter().position(|t| t.uid == uid).unwrap();
        self.known[idx].fill_from_record(&record);
        Ok(self.known[idx].clone())
    }

    /// Writes only the fields that differ from EEPROM, including
    /// `last_base_mac`, and reports which field names actually changed.
    pub async fn commit(&mut self, tank: TankInfo) -> Result<Vec<&'static str>, Error> {
        let bus = self
            .find(tank.uid)
            .filter(|t| t.bus_index >= 0)
            .map(|t| t.bus_index as u8)
            .ok_or(Error::TankUnavailable(0xFF))?;
        let existing = self.read_and_verify(bus).await?;
        let (next, changed) = tank.to_record_diff(&existing, self.host_mac);
        self.write_record(bus, &next).await?;
        let idx = self.known.iter().position(|t| t.uid == tank.uid).unwrap();
        self.known[idx] = tank;
        Ok(changed)
    }

    /// Updates only `remaining_grams`, recomputing ECC over the full
    /// record as every write must (no partial-field fast path).
    pub async fn update_remaining_grams(&mut self, uid: u64, grams: f32) -> Result<(), Error> {
        let bus = self
            .find(uid)
            .filter(|t| t.bus_index >= 0)
            .map(|t| t.bus_index as u8)
            .ok_or(Error::TankUnavailable(0xFF))?;
        let mut existing = self.read_and_verify(bus).await?;
        existing.remaining_grams = grams.round().clamp(0.0, u16::MAX as f32) as u16;
        self.write_record(bus, &existing).await?;
        if let Some(idx) = self.known.iter().position(|t| t.uid == uid) {
            self.known[idx].remaining_weight_g = grams;
        }
        Ok(())
    }

    /// Switches the PWM driver between servo mode (auger/hopper motion) and
    /// bus-power mode (EEPROM pull-up supply); a `refresh` may only run in
    /// the latter.
    pub async fn set_servo_power(&self, on: bool) -> Result<(), Error> {
        let mode = if on { ChannelMode::Servo } else { ChannelMode::BusPower };
        self.pwm.lock().await.set_mode(mode).await
    }

    /// Drives `channel`'s auger at `speed` in `[-1.0, 1.0]`, centered on the
    /// calibrated neutral of whichever known tank occupies that bus (or a
    /// generic 1500 us neutral if none is known there yet). Speeds with
    /// magnitude under the dead zone are clamped to exactly neutral.
    pub async fn set_continuous_servo(&self, channel: u8, speed: f32) -> Result<(), Error> {
        let neutral = self
            .known
            .iter()
            .find(|t| t.bus_index == channel as i8)
            .map(|t| t.servo_idle_us)
            .unwrap_or(1500);
        let clamped = if speed.abs() < CONTINUOUS_DEAD_ZONE { 0.0 } else { speed.clamp(-1.0, 1.0) };
        let offset = (clamped * CONTINUOUS_SPAN_US as f32).round() as i32;
        let us = (neutral as i32 + offset).clamp(0, u16::MAX as i32) as u16;
        self.pwm.lock().await.set_microseconds(channel, us).await
    }

    pub async fn set_servo_us(&self, channel: u8, us: u16) -> Result<(), Error> {
        self.pwm.lock().await.set_microseconds(channel, us).await
    }

    pub async fn open_hopper(&self, open_pulse_us: u16) -> Result<(), Error> {
        self.set_servo_us(HOPPER_CHANNEL, open_pulse_us).await
    }

    pub async fn close_hopper(&self, closed_pulse_us: u16) -> Result<(), Error> {
        self.set_servo_us(HOPPER_CHANNEL, closed_pulse_us).await
    }

    /// Commands every channel to neutral, waits for mechanical settle, then
    /// cuts servo power.
    pub async fn stop_all_servos(&self) -> Result<(), Error> {
        pwm::emergency_stop(&self.pwm).await
    }
}

#[async_trait::async_trait]
impl<T, P> HopperActuator for TankRegistry<T, P>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    P: PwmDriver,
{
    async fn open_hopper(&self, open_pulse_us: u16) -> Result<(), Error> {
        TankRegistry::open_hopper(self, open_pulse_us).await
    }

    async fn close_hopper(&self, closed_pulse_us: u16) -> Result<(), Error> {
        TankRegistry::close_hopper(self, closed_pulse_us).await
    }

    async fn set_servo_us(&self, channel: u8, us: u16) -> Result<(), Error> {
        TankRegistry::set_servo_us(self, channel, us).await
    }

    async fn set_continuous_servo(&self, channel: u8, speed: f32) -> Result<(), Error> {
        TankRegistry::set_continuous_servo(self, channel, speed).await
    }

    async fn stop_all_servos(&self) -> Result<(), Error> {
        TankRegistry::stop_all_servos(self).await
    }

    fn channel_for_tank(&self, uid: u64) -> Option<u8> {
        self.find(uid).filter(|t| t.bus_index >= 0).map(|t| t.bus_index as u8)
    }

    fn density_kg_per_l(&self, uid: u64) -> Option<f32> {
        self.find(uid).map(|t| t.density_kg_per_l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::hardware::bus_bridge::Opcode;
    use crate::devices::hardware::pwm::SoftPwmDriver;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn test_registry() -> TankRegistry<tokio::io::DuplexStream, SoftPwmDriver> {
        let (client_io, _peer) = duplex(4096);
        let bridge = Arc::new(BusBridge::new(client_io));
        let pwm = Arc::new(Mutex::new(SoftPwmDriver::new()));
        TankRegistry::new(bridge, pwm, [1, 2, 3, 4, 5, 6])
    }

    #[tokio::test]
    async fn refresh_requires_bus_power_mode() {
        let mut registry = test_registry();
        registry.pwm.lock().await.set_mode(ChannelMode::Servo).await.unwrap();
        let result = registry.refresh(ALL_BUSES).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn continuous_servo_centers_on_the_known_tanks_idle_pulse() {
        let mut registry = test_registry();
        let mut tank = TankInfo::witness(42, 0);
        tank.servo_idle_us = 1400;
        registry.known.push(tank);

        registry.set_continuous_servo(0, 1.0).await.unwrap();
        assert_eq!(registry.pwm.lock().await.current_pulse(0), Some(1900));

        registry.set_continuous_servo(0, -1.0).await.unwrap();
        assert_eq!(registry.pwm.lock().await.current_pulse(0), Some(900));
    }

    #[tokio::test]
    async fn continuous_servo_dead_zone_snaps_to_neutral() {
        let mut registry = test_registry();
        let mut tank = TankInfo::witness(42, 2);
        tank.servo_idle_us = 1500;
        registry.known.push(tank);
        registry.set_continuous_servo(2, 0.005).await.unwrap();
        assert_eq!(registry.pwm.lock().await.current_pulse(2), Some(1500));
    }

    #[tokio::test]
    async fn stop_all_servos_mutes_then_cuts_power() {
        let mut registry = test_registry();
        registry.pwm.lock().await.set_microseconds(0, 1800).await.unwrap();
        registry.pwm.lock().await.set_power_gate(true).await.unwrap();
        registry.stop_all_servos().await.unwrap();
        assert_eq!(registry.pwm.lock().await.current_pulse(0), Some(0));
        assert!(!registry.pwm.lock().await.power_gate_on());
    }

    #[tokio::test]
    async fn pwm_handle_shares_state_with_the_registrys_own_driver() {
        let registry = test_registry();
        let handle = registry.pwm_handle();
        handle.lock().await.set_microseconds(3, 1700).await.unwrap();
        assert_eq!(registry.pwm.lock().await.current_pulse(3), Some(1700));
    }

    #[tokio::test]
    async fn commit_and_refresh_tank_info_reject_an_absent_tank() {
        let mut registry = test_registry();
        assert!(matches!(
            registry.refresh_tank_info(999).await,
            Err(Error::TankUnavailable(_))
        ));
        let ghost = TankInfo::witness(999, -1);
        assert!(matches!(registry.commit(ghost).await, Err(Error::TankUnavailable(_))));
    }

    #[tokio::test]
    async fn phase_b_detaches_a_tank_whose_bus_now_reports_a_different_uid() {
        let mut registry = test_registry();
        registry.pwm.lock().await.set_mode(ChannelMode::BusPower).await.unwrap();
        let mut tank = TankInfo::witness(7, 2);
        tank.full_info = true;
        registry.known.push(tank);

        // With no responder on the duplex stream, get_uid/roll_call will
        // time out and return 0 for every bus, simulating every tank
        // having gone silent; the known tank at bus 2 should detach.
        let changed = registry.refresh(1 << 2).await.unwrap();
        assert!(changed);
        assert!(registry.known_tanks().is_empty());
    }

    #[test]
    fn never_placed_sentinel_is_not_a_valid_bus_index() {
        assert_eq!(NEVER_PLACED_BUS, 0xFF);
    }

    fn frame_bytes(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mut reply = vec![opcode as u8, !(opcode as u8), payload.len() as u8];
        reply.extend_from_slice(payload);
        reply
    }

    #[tokio::test]
    async fn refresh_keeps_every_tanks_uid_and_bus_index_distinct() {
        let (client_io, mut peer) = duplex(4096);
        let bridge = Arc::new(BusBridge::new(client_io));
        let pwm = Arc::new(Mutex::new(SoftPwmDriver::new()));
        pwm.lock().await.set_mode(ChannelMode::BusPower).await.unwrap();
        let mut registry = TankRegistry::new(bridge, pwm, [9, 9, 9, 9, 9, 9]);

        let codeword = rs_codec::encode(&TankRecord::new_tank_default().to_bytes());
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];

            // Phase A: roll call reports two distinct tanks on buses 0 and 1.
            let _ = peer.read(&mut buf).await.unwrap();
            let mut roll_call_payload = vec![0u8; BUS_COUNT * 8];
            roll_call_payload[0..8].copy_from_slice(&0x1111u64.to_le_bytes());
            roll_call_payload[8..16].copy_from_slice(&0x2222u64.to_le_bytes());
            peer.write_all(&frame_bytes(Opcode::RollCall, &roll_call_payload)).await.unwrap();

            // Phase C: a record read for each of the two occupied buses, in order.
            for bus in [0u8, 1u8] {
                let _ = peer.read(&mut buf).await.unwrap();
                let mut read_payload = vec![bus, 0, 0, CODEWORD as u8];
                read_payload.extend_from_slice(&codeword);
                peer.write_all(&frame_bytes(Opcode::ReadBytes, &read_payload)).await.unwrap();
            }
        });

        let changed = registry.refresh(ALL_BUSES).await.unwrap();
        responder.await.unwrap();
        assert!(changed);

        let tanks = registry.known_tanks();
        assert_eq!(tanks.len(), 2);
        for (i, a) in tanks.iter().enumerate() {
            for b in &tanks[i + 1..] {
                assert_ne!(a.uid, b.uid, "two tanks share a uid after refresh");
                if a.bus_index >= 0 && b.bus_index >= 0 {
                    assert_ne!(a.bus_index, b.bus_index, "two tanks share a bus index after refresh");
                }
            }
        }
    }
}
