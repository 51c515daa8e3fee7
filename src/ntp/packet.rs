//! NTPv4 header encoding and timestamp arithmetic.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |LI | VN  |Mode |    Stratum     |     Poll      |  Precision   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Root Delay                            |
//! |                         Root Dispersion                       |
//! |                          Reference ID                         |
//! |                     Reference Timestamp (64)                  |
//! |                      Origin Timestamp (64)                    |
//! |                      Receive Timestamp (64)                   |
//! |                      Transmit Timestamp (64)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::io::{self, Cursor};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::error::{CheckerError, NtpErrorKind, Result};

/// Size of the NTP header without extension fields or MAC.
pub const PACKET_SIZE: usize = 48;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch.
const NTP_UNIX_OFFSET_SECS: i128 = 2_208_988_800;
const ERA_SECS: i128 = 1 << 32;
const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Leap indicator warning of an impending leap second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LeapIndicator {
    #[default]
    NoWarning,
    AddOne,
    SubOne,
    Unknown,
}

impl LeapIndicator {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => LeapIndicator::NoWarning,
            1 => LeapIndicator::AddOne,
            2 => LeapIndicator::SubOne,
            _ => LeapIndicator::Unknown,
        }
    }

    fn bits(self) -> u8 {
        match self {
            LeapIndicator::NoWarning => 0,
            LeapIndicator::AddOne => 1,
            LeapIndicator::SubOne => 2,
            LeapIndicator::Unknown => 3,
        }
    }
}

/// Association modes used by a one-shot client.
pub const MODE_CLIENT: u8 = 3;
pub const MODE_SERVER: u8 = 4;

/// 64-bit NTP timestamp: seconds and fraction since the start of an era.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl Timestamp {
    /// Encode a Unix time given in nanoseconds.
    pub fn from_unix_nanos(nanos: i128) -> Self {
        let ntp_nanos = nanos + NTP_UNIX_OFFSET_SECS * NANOS_PER_SEC;
        let secs = ntp_nanos.div_euclid(NANOS_PER_SEC);
        let sub = ntp_nanos.rem_euclid(NANOS_PER_SEC);
        Self {
            seconds: secs.rem_euclid(ERA_SECS) as u32,
            fraction: ((sub << 32) / NANOS_PER_SEC) as u32,
        }
    }

    /// Decode into Unix nanoseconds, picking the era closest to `pivot`.
    pub fn to_unix_nanos(self, pivot: i128) -> i128 {
        let pivot_secs = pivot.div_euclid(NANOS_PER_SEC) + NTP_UNIX_OFFSET_SECS;
        let era = pivot_secs.div_euclid(ERA_SECS);
        let mut secs = era * ERA_SECS + self.seconds as i128;
        if secs - pivot_secs > ERA_SECS / 2 {
            secs -= ERA_SECS;
        } else if pivot_secs - secs > ERA_SECS / 2 {
            secs += ERA_SECS;
        }
        let frac_nanos = (self.fraction as i128 * NANOS_PER_SEC) >> 32;
        (secs - NTP_UNIX_OFFSET_SECS) * NANOS_PER_SEC + frac_nanos
    }

    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.fraction == 0
    }

    fn read_from<R: ReadBytesExt>(reader: &mut R) -> io::Result<Self> {
        let seconds = reader.read_u32::<BE>()?;
        let fraction = reader.read_u32::<BE>()?;
        Ok(Self { seconds, fraction })
    }

    fn write_to<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<BE>(self.seconds)?;
        writer.write_u32::<BE>(self.fraction)
    }
}

/// 32-bit NTP short format used for root delay and dispersion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShortFormat {
    pub seconds: u16,
    pub fraction: u16,
}

impl ShortFormat {
    pub fn to_duration(self) -> Duration {
        let nanos = (self.fraction as u64 * 1_000_000_000) >> 16;
        Duration::from_secs(self.seconds as u64) + Duration::from_nanos(nanos)
    }

    fn read_from<R: ReadBytesExt>(reader: &mut R) -> io::Result<Self> {
        let seconds = reader.read_u16::<BE>()?;
        let fraction = reader.read_u16::<BE>()?;
        Ok(Self { seconds, fraction })
    }

    fn write_to<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u16::<BE>(self.seconds)?;
        writer.write_u16::<BE>(self.fraction)
    }
}

/// NTPv4 packet header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub leap_indicator: LeapIndicator,
    pub version: u8,
    pub mode: u8,
    pub stratum: u8,
    /// Maximum interval between messages, log2 seconds
    pub poll: i8,
    /// Precision of the server clock, log2 seconds
    pub precision: i8,
    pub root_delay: ShortFormat,
    pub root_dispersion: ShortFormat,
    pub reference_id: u32,
    pub reference_timestamp: Timestamp,
    pub origin_timestamp: Timestamp,
    pub receive_timestamp: Timestamp,
    pub transmit_timestamp: Timestamp,
}

impl Packet {
    /// Build a client request carrying `transmit` as T1.
    pub fn client_request(version: u8, transmit: Timestamp) -> Self {
        Self {
            version,
            mode: MODE_CLIENT,
            transmit_timestamp: transmit,
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_SIZE);
        // Writing into a Vec never fails.
        let _ = self.write_to(&mut buf);
        buf
    }

    fn write_to<W: WriteBytesExt>(&self, writer: &mut W) -> io::Result<()> {
        let li_vn_mode =
            (self.leap_indicator.bits() << 6) | ((self.version & 0b111) << 3) | (self.mode & 0b111);
        writer.write_u8(li_vn_mode)?;
        writer.write_u8(self.stratum)?;
        writer.write_i8(self.poll)?;
        writer.write_i8(self.precision)?;
        self.root_delay.write_to(writer)?;
        self.root_dispersion.write_to(writer)?;
        writer.write_u32::<BE>(self.reference_id)?;
        self.reference_timestamp.write_to(writer)?;
        self.origin_timestamp.write_to(writer)?;
        self.receive_timestamp.write_to(writer)?;
        self.transmit_timestamp.write_to(writer)
    }

    /// Parse the first 48 bytes; trailing extension fields are ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < PACKET_SIZE {
            return Err(CheckerError::ntp(
                NtpErrorKind::InvalidResponse,
                format!("NTP response too short ({} bytes)", buf.len()),
            ));
        }

        Self::read_from(&mut Cursor::new(buf)).map_err(|e| {
            CheckerError::ntp(NtpErrorKind::InvalidResponse, format!("malformed NTP response: {}", e))
        })
    }

    fn read_from<R: ReadBytesExt>(reader: &mut R) -> io::Result<Self> {
        let li_vn_mode = reader.read_u8()?;
        Ok(Self {
            leap_indicator: LeapIndicator::from_bits(li_vn_mode >> 6),
            version: (li_vn_mode >> 3) & 0b111,
            mode: li_vn_mode & 0b111,
            stratum: reader.read_u8()?,
            poll: reader.read_i8()?,
            precision: reader.read_i8()?,
            root_delay: ShortFormat::read_from(reader)?,
            root_dispersion: ShortFormat::read_from(reader)?,
            reference_id: reader.read_u32::<BE>()?,
            reference_timestamp: Timestamp::read_from(reader)?,
            origin_timestamp: Timestamp::read_from(reader)?,
            receive_timestamp: Timestamp::read_from(reader)?,
            transmit_timestamp: Timestamp::read_from(reader)?,
        })
    }

    /// Kiss code carried in the reference id of a stratum-0 packet.
    ///
    /// Printable ASCII bytes are kept and NULs dropped. A reference id with
    /// no printable byte is rendered as eight hex digits instead, so the
    /// code is never empty.
    pub fn kiss_code(&self) -> String {
        let code: String = self
            .reference_id
            .to_be_bytes()
            .iter()
            .filter(|b| b.is_ascii_graphic())
            .map(|&b| b as char)
            .collect();
        if code.is_empty() {
            format!("0x{:08X}", self.reference_id)
        } else {
            code
        }
    }
}

/// Current local time as Unix nanoseconds.
pub fn unix_now_nanos() -> i128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    }
}
