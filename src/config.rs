use std::convert::TryFrom;

use clap::Parser;

use crate::error::DbError;

/// Maximum number of diversity adapters the air bridge can fan frames out
/// to. Mirrors `DB_MAX_ADAPTERS` in the original DroneBridge sources.
pub const DB_MAX_ADAPTERS: usize = 8;

/// Status-beacon cadence and readiness-wait timeout, in milliseconds.
pub const BEACON_PERIOD_MS: u64 = 200;

/// Window over which accepted RC frames are counted for `recv_pack_sec`.
pub const RC_WINDOW_MS: u64 = 1000;

/// How many times a transparent-mode chunk is blindly retransmitted.
pub const RETRANSMISSION_RATE: u32 = 2;

/// How many whole MAVLink messages a telemetry batch holds before it is
/// flushed. Unbounded in time: a quiet link can hold bytes indefinitely.
pub const TELEMETRY_BATCH_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialProtocol {
    MspV1 = 1,
    MspV2 = 2,
    MavLinkV1 = 3,
    MavLinkV2 = 4,
    MavLinkTransparent = 5,
}

impl TryFrom<u8> for SerialProtocol {
    type Error = DbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SerialProtocol::MspV1),
            2 => Ok(SerialProtocol::MspV2),
            3 => Ok(SerialProtocol::MavLinkV1),
            4 => Ok(SerialProtocol::MavLinkV2),
            5 => Ok(SerialProtocol::MavLinkTransparent),
            other => Err(DbError::ConfigInvalid(format!(
                "serial_protocol must be 1-5, got {other}"
            ))),
        }
    }
}

impl SerialProtocol {
    pub fn is_mavlink(self) -> bool {
        matches!(
            self,
            SerialProtocol::MavLinkV1 | SerialProtocol::MavLinkV2 | SerialProtocol::MavLinkTransparent
        )
    }

    pub fn is_transparent(self) -> bool {
        matches!(self, SerialProtocol::MavLinkTransparent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Rts = 1,
    Data = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = DbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Rts),
            2 => Ok(FrameType::Data),
            other => Err(DbError::ConfigInvalid(format!(
                "frame_type must be 1 (RTS) or 2 (DATA), got {other}"
            ))),
        }
    }
}

const VALID_BAUD_RATES: [u32; 7] = [2400, 4800, 9600, 19200, 38400, 57600, 115200];

/// Raw command-line arguments, validated once into a [`Config`].
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-air-bridge",
    version,
    about = "Air-side multiplexing bridge between diversity radios and a flight controller"
)]
pub struct Args {
    /// Wireless network interface name in monitor mode. Repeat for diversity.
    #[arg(short = 'n', long = "adapter", required = true)]
    pub adapters: Vec<String>,

    /// Serial device connected to the flight controller (MSP/MAVLink).
    #[arg(short = 'u', long = "control-serial", default_value = "/dev/serial1")]
    pub control_serial_path: String,

    /// Serial device used for SUMD RC output, if `--use-sumd` is set.
    #[arg(short = 's', long = "rc-serial", default_value = "/dev/serial1")]
    pub rc_serial_path: String,

    /// DroneBridge radio mode. 'm' (monitor) is the only supported value.
    #[arg(short = 'm', long = "mode", default_value = "m")]
    pub mode: char,

    /// Communication ID. Must match the ground station (0-255).
    #[arg(short = 'c', long = "comm-id", default_value_t = 0)]
    pub comm_id: u8,

    /// Serial protocol: 1=MSPv1 2=MSPv2 3=MAVLinkV1 4=MAVLinkV2 5=MAVLink transparent.
    #[arg(short = 'v', long = "serial-protocol", default_value_t = 2)]
    pub serial_protocol: u8,

    /// Bytes per transparent-mode frame (only used with protocol 5).
    #[arg(short = 'l', long = "chunk-size", default_value_t = 64)]
    pub chunk_size: usize,

    /// Enable a dedicated SUMD serial port for RC.
    #[arg(short = 'e', long = "use-sumd", default_value_t = false)]
    pub use_sumd: bool,

    /// Control-serial baud rate.
    #[arg(short = 'r', long = "baud", default_value_t = 115_200)]
    pub baud: u32,

    /// DroneBridge raw frame type: 1=RTS 2=DATA.
    #[arg(short = 't', long = "frame-type", default_value_t = 2)]
    pub frame_type: u8,

    /// Bitrate option in Mbps (Ralink-chipset specific).
    #[arg(short = 'b', long = "bitrate", default_value_t = 1)]
    pub bitrate_option: u8,

    /// Offset payload outside the 802.11 header (non DB-Rasp kernels).
    #[arg(short = 'a', long = "offset-80211", default_value_t = false)]
    pub offset_80211: bool,
}

/// Validated, enumerated configuration consumed by the engine.
///
/// Replaces the ad-hoc character-switch parsing of the original with a
/// single record checked once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub adapters: Vec<String>,
    pub control_serial_path: String,
    pub rc_serial_path: String,
    pub comm_id: u8,
    pub serial_protocol: SerialProtocol,
    pub chunk_size: usize,
    pub use_sumd: bool,
    pub baud: u32,
    pub frame_type: FrameType,
    pub bitrate_option: u8,
    pub offset_80211: bool,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, DbError> {
        if args.adapters.is_empty() {
            return Err(DbError::ConfigInvalid("at least one -n adapter is required".into()));
        }
        if args.adapters.len() > DB_MAX_ADAPTERS {
            return Err(DbError::ConfigInvalid(format!(
                "at most {DB_MAX_ADAPTERS} adapters are supported, got {}",
                args.adapters.len()
            )));
        }
        if !VALID_BAUD_RATES.contains(&args.baud) {
            return Err(DbError::ConfigInvalid(format!(
                "baud must be one of {VALID_BAUD_RATES:?}, got {}",
                args.baud
            )));
        }
        if args.chunk_size == 0 {
            return Err(DbError::ConfigInvalid("chunk_size must be > 0".into()));
        }
        if args.mode != 'm' {
            return Err(DbError::ConfigInvalid(
                "mode 'w' (wifi) is not supported by this build; only 'm' (monitor)".into(),
            ));
        }
        if args.use_sumd && args.rc_serial_path == args.control_serial_path {
            return Err(DbError::ConfigInvalid(
                "rc_serial_path must differ from control_serial_path when --use-sumd is set".into(),
            ));
        }

        let serial_protocol = SerialProtocol::try_from(args.serial_protocol)?;
        let frame_type = FrameType::try_from(args.frame_type)?;

        Ok(Config {
            adapters: args.adapters,
            control_serial_path: args.control_serial_path,
            rc_serial_path: args.rc_serial_path,
            comm_id: args.comm_id,
            serial_protocol,
            chunk_size: args.chunk_size,
            use_sumd: args.use_sumd,
            baud: args.baud,
            frame_type,
            bitrate_option: args.bitrate_option,
            offset_80211: args.offset_80211,
        })
    }
}
