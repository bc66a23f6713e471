//! Client for the UART bridge that multiplexes up to six independent
//! 1-Wire buses, one per tank slot.
//!
//! The wire framing is `{opcode, !opcode, len, payload}`: the bitwise
//! complement of the opcode byte lets a corrupted opcode be rejected
//! outright instead of silently dispatched as the wrong command. This
//! module is generic over the transport (`AsyncRead + AsyncWrite`) rather
//! than tied to a concrete serial-port crate, since wiring the real UART
//! device node (57600 8N1) is the surrounding platform's job.

use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Independent 1-Wire buses the bridge multiplexes.
pub const BUS_COUNT: usize = 6;
/// A bridge-reported UID of all ones means "no device on this bus".
const SENTINEL_UID: u64 = u64::MAX;

pub const PRESENCE_TIMEOUT: Duration = Duration::from_millis(3);
pub const GET_UID_TIMEOUT: Duration = Duration::from_millis(100);
pub const BLOCK_TIMEOUT: Duration = Duration::from_millis(600);
pub const ROLL_CALL_TIMEOUT: Duration = Duration::from_millis(333);

/// Bus-bridge opcodes, matching the external interface's wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Wake = 0x00,
    Sleep = 0x01,
    GetPresence = 0x02,
    RollCall = 0x03,
    GetUid = 0x04,
    ReadBytes = 0x05,
    WriteBytes = 0x06,
}

impl Opcode {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Opcode::Wake),
            0x01 => Some(Opcode::Sleep),
            0x02 => Some(Opcode::GetPresence),
            0x03 => Some(Opcode::RollCall),
            0x04 => Some(Opcode::GetUid),
            0x05 => Some(Opcode::ReadBytes),
            0x06 => Some(Opcode::WriteBytes),
            _ => None,
        }
    }
}

/// A single bridge frame: opcode plus payload. The complement byte and
/// length prefix are wire-only details the codec hides from callers.
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// `Encoder`/`Decoder` for the bridge's byte-stream framing.
#[derive(Default)]
pub struct BridgeCodec;

impl Encoder<Frame> for BridgeCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > u8::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bridge payload too large"));
        }
        dst.reserve(3 + frame.payload.len());
        dst.put_u8(frame.opcode as u8);
        dst.put_u8(!(frame.opcode as u8));
        dst.put_u8(frame.payload.len() as u8);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for BridgeCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 3 {
            return Ok(None);
        }
        let opcode_byte = src[0];
        let complement = src[1];
        let len = src[2] as usize;
        if opcode_byte != !complement {
            src.advance(1);
            return Err(io::Error::new(io::ErrorKind::InvalidData, "opcode/complement mismatch"));
        }
        if src.len() < 3 + len {
            src.reserve(3 + len - src.len());
            return Ok(None);
        }
        let opcode = Opcode::from_u8(opcode_byte)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown bridge opcode"))?;
        src.advance(3);
        let payload = src.split_to(len).to_vec();
        Ok(Some(Frame { opcode, payload }))
    }
}

/// `{bus_count, presence_bitmap}` returned by [`BusBridge::poll_presence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub bus_count: u8,
    pub presence_bitmap: u8,
}

impl Presence {
    pub fn is_present(&self, bus_index: u8) -> bool {
        self.presence_bitmap & (1 << bus_index) != 0
    }
}

fn normalize_uid(raw: u64) -> u64 {
    if raw == SENTINEL_UID {
        0
    } else {
        raw
    }
}

/// Client for the bridge. Every public method acquires the transport lock
/// for exactly the duration of its own request/response exchange; none
/// holds it across an `.await` on anything else, so the "recursive bridge
/// lock" spec section 5 describes never needs to be modelled as a true
/// re-entrant lock here - see DESIGN.md for the reentrancy note.
pub struct BusBridge<T> {
    transport: Mutex<T>,
}

impl<T> BusBridge<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(transport: T) -> Self {
        BusBridge { transport: Mutex::new(transport) }
    }

    async fn request(&self, frame: Frame, timeout_dur: Duration) -> Result<Frame, Error> {
        timeout(timeout_dur, self.request_inner(frame))
            .await
            .map_err(|_| Error::BusTimeout(timeout_dur))?
    }

    async fn request_inner(&self, frame: Frame) -> Result<Frame, Error> {
        let mut guard = self.transport.lock().await;
        let mut codec = BridgeCodec;
        let mut encoded = BytesMut::new();
        codec.encode(frame, &mut encoded).map_err(|e| Error::BusFraming(e.to_string()))?;
        guard.write_all(&encoded).await.map_err(Error::Io)?;
        guard.flush().await.map_err(Error::Io)?;

        let mut buf = BytesMut::with_capacity(256);
        loop {
            let mut chunk = [0u8; 64];
            let n = guard.read(&mut chunk).await.map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::BusFraming("bridge closed the connection".into()));
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(reply) = codec.decode(&mut buf).map_err(|e| Error::BusFraming(e.to_string()))? {
                return Ok(reply);
            }
        }
    }

    fn check_bus_index(bus_index: u8) -> Result<(), Error> {
        if bus_index as usize >= BUS_COUNT {
            return Err(Error::BusIndexOutOfRange(bus_index));
        }
        Ok(())
    }

    /// Emits the wake opcode until an acknowledgement arrives, clearing any
    /// pending rx first. `retries` bounds how many attempts are made
    /// before giving up Silent.
    pub async fn wake(&self, retries: u8) -> Result<(), Error> {
        let mut last_err = Error::BusNoResponse(0xFF);
        for _ in 0..retries.max(1) {
            match self.request(Frame { opcode: Opcode::Wake, payload: vec![] }, GET_UID_TIMEOUT).await {
                Ok(_) => return Ok(()),
                Err(e) => last_err = e,
            }
        }
        warn!("bridge did not acknowledge wake after {retries} attempt(s)");
        Err(last_err)
    }

    /// Commands the bridge into low-power mode.
    pub async fn sleep(&self) -> Result<(), Error> {
        self.request(Frame { opcode: Opcode::Sleep, payload: vec![] }, GET_UID_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Returns which buses currently see a device.
    pub async fn poll_presence(&self) -> Result<Presence, Error> {
        let reply = self
            .request(Frame { opcode: Opcode::GetPresence, payload: vec![] }, PRESENCE_TIMEOUT)
            .await?;
        if reply.payload.len() < 3 {
            return Err(Error::BusFraming("short GetPresence reply".into()));
        }
        let presence_lsb = reply.payload[0];
        let presence_msb = reply.payload[1];
        let bus_count = reply.payload[2];
        Ok(Presence {
            bus_count,
            // Six buses fit in the low 6 bits of a single byte; the msb
            // byte is carried by the wire format for headroom but unused
            // at this bus count.
            presence_bitmap: presence_lsb | presence_msb,
        })
    }

    /// Per-bus UID for every one of the six buses; `0` means empty. A
    /// bridge-returned all-ones sentinel is normalized to `0`.
    pub async fn roll_call(&self) -> Result<[u64; BUS_COUNT], Error> {
        let reply = self
            .request(Frame { opcode: Opcode::RollCall, payload: vec![] }, ROLL_CALL_TIMEOUT)
            .await?;
        if reply.payload.len() != BUS_COUNT * 8 {
            return Err(Error::InvalidPayload(format!(
                "roll call expected {} bytes, got {}",
                BUS_COUNT * 8,
                reply.payload.len()
            )));
        }
        let mut uids = [0u64; BUS_COUNT];
        for (i, chunk) in reply.payload.chunks_exact(8).enumerate() {
            uids[i] = normalize_uid(u64::from_le_bytes(chunk.try_into().unwrap()));
        }
        Ok(uids)
    }

    /// Reads the 64-bit unique identifier of the tank occupying `bus_index`.
    pub async fn get_uid(&self, bus_index: u8) -> Result<u64, Error> {
        Self::check_bus_index(bus_index)?;
        let reply = self
            .request(Frame { opcode: Opcode::GetUid, payload: vec![bus_index] }, GET_UID_TIMEOUT)
            .await?;
        if reply.payload.len() != 8 {
            return Err(Error::InvalidPayload(format!(
                "get_uid expected 8 bytes, got {}",
                reply.payload.len()
            )));
        }
        Ok(normalize_uid(u64::from_le_bytes(reply.payload[..8].try_into().unwrap())))
    }

    /// Reads `len` bytes starting at `offset` from the EEPROM at
    /// `bus_index`, rejecting a reply whose echoed header (opcode,
    /// bus_index, offset) does not match the request or whose reported
    /// length exceeds what was requested.
    pub async fn read(&self, bus_index: u8, offset: u16, len: u8) -> Result<Vec<u8>, Error> {
        Self::check_bus_index(bus_index)?;
        if len == 0 {
            return Err(Error::NullBuffer);
        }
        let mut payload = vec![bus_index];
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.push(len);
        let reply = self
            .request(Frame { opcode: Opcode::ReadBytes, payload }, BLOCK_TIMEOUT)
            .await?;

        if reply.payload.len() < 4 {
            return Err(Error::ReadRespError("reply shorter than its echoed header".into()));
        }
        let echoed_bus = reply.payload[0];
        let echoed_offset = u16::from_le_bytes([reply.payload[1], reply.payload[2]]);
        let reported_len = reply.payload[3];
        if echoed_bus != bus_index || echoed_offset != offset {
            return Err(Error::ReadRespError(format!(
                "header echo mismatch: bus {echoed_bus} (want {bus_index}), offset {echoed_offset} (want {offset})"
            )));
        }
        if reported_len as usize > len as usize {
            return Err(Error::ReadRespError(format!(
                "reported length {reported_len} exceeds requested {len}"
            )));
        }
        let data = &reply.payload[4..];
        if data.len() != reported_len as usize {
            return Err(Error::ReadRespError("payload length does not match reported length".into()));
        }
        Ok(data.to_vec())
    }

    /// Writes `data` to the EEPROM at `bus_index` starting at `offset`,
    /// awaiting the write acknowledgement.
    pub async fn write(&self, bus_index: u8, offset: u16, data: &[u8]) -> Result<(), Error> {
        Self::check_bus_index(bus_index)?;
        if data.is_empty() {
            return Err(Error::NullBuffer);
        }
        let mut payload = vec![bus_index];
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(data);
        self.request(Frame { opcode: Opcode::WriteBytes, payload }, BLOCK_TIMEOUT)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn get_uid_normalizes_the_all_ones_sentinel_to_zero() {
        let (client_io, mut peer) = duplex(256);
        let bridge = BusBridge::new(client_io);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let _ = peer.read(&mut buf).await.unwrap();
            let mut reply = vec![Opcode::GetUid as u8, !(Opcode::GetUid as u8), 8];
            reply.extend_from_slice(&[0xFF; 8]);
            peer.write_all(&reply).await.unwrap();
        });

        let uid = bridge.get_uid(2).await.unwrap();
        assert_eq!(uid, 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn get_uid_rejects_an_out_of_range_bus() {
        let (client_io, _peer) = duplex(256);
        let bridge = BusBridge::new(client_io);
        let result = bridge.get_uid(6).await;
        assert!(matches!(result, Err(Error::BusIndexOutOfRange(6))));
    }

    #[tokio::test]
    async fn request_times_out_when_the_bridge_never_replies() {
        let (client_io, _peer) = duplex(256);
        let bridge = BusBridge::new(client_io);
        let result = bridge.get_uid(0).await;
        assert!(matches!(result, Err(Error::BusTimeout(_))));
    }

    #[tokio::test]
    async fn read_rejects_a_reply_whose_echoed_header_does_not_match() {
        let (client_io, mut peer) = duplex(256);
        let bridge = BusBridge::new(client_io);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = peer.read(&mut buf).await.unwrap();
            // Echo back bus_index = 3 when the request was for bus 0.
            let mut reply_payload = vec![3u8, 0, 0, 1, 0xAA];
            let mut reply = vec![Opcode::ReadBytes as u8, !(Opcode::ReadBytes as u8)];
            reply.push(reply_payload.len() as u8);
            reply.append(&mut reply_payload);
            peer.write_all(&reply).await.unwrap();
        });

        let result = bridge.read(0, 0, 1).await;
        assert!(matches!(result, Err(Error::ReadRespError(_))));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn read_rejects_an_oversized_reported_length() {
        let (client_io, mut peer) = duplex(256);
        let bridge = BusBridge::new(client_io);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = peer.read(&mut buf).await.unwrap();
            let mut reply_payload = vec![0u8, 0, 0, 5, 1, 2, 3, 4, 5];
            let mut reply = vec![Opcode::ReadBytes as u8, !(Opcode::ReadBytes as u8)];
            reply.push(reply_payload.len() as u8);
            reply.append(&mut reply_payload);
            peer.write_all(&reply).await.unwrap();
        });

        // Requested only 2 bytes; the bridge (mis)reports 5.
        let result = bridge.read(0, 0, 2).await;
        assert!(matches!(result, Err(Error::ReadRespError(_))));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn write_rejects_an_empty_buffer() {
        let (client_io, _peer) = duplex(256);
        let bridge = BusBridge::new(client_io);
        let result = bridge.write(0, 0, &[]).await;
        assert!(matches!(result, Err(Error::NullBuffer)));
    }

    #[test]
    fn codec_round_trips_a_write_bytes_frame() {
        let mut codec = BridgeCodec;
        let mut buf = BytesMut::new();
        let frame = Frame { opcode: Opcode::WriteBytes, payload: vec![1, 2, 3, 4, 5] };
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.opcode, frame.opcode);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn presence_is_present_reads_the_correct_bit() {
        let presence = Presence { bus_count: 6, presence_bitmap: 0b0010_0001 };
        assert!(presence.is_present(0));
        assert!(presence.is_present(5));
        assert!(!presence.is_present(1));
    }
}
