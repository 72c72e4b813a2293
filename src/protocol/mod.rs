//! Abstract switch protocol model.
//!
//! Message shapes follow the OpenFlow 1.0 vocabulary but carry only the
//! fields the connection core reads. Wire encoding lives in [`codec`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod codec;

/// Transaction id correlating requests with replies.
pub type Xid = u32;

/// `miss_send_len` asking the switch to ship whole packets to the controller.
pub const MISS_SEND_LEN_MAX: u16 = 0xffff;

/// Port `config` bit: administratively down.
pub const PORT_CONFIG_DOWN: u32 = 1 << 0;
/// Port `state` bit: no physical link.
pub const PORT_STATE_LINK_DOWN: u32 = 1 << 0;

// ── Identity ────────────────────────────────────────────────────────────────

/// 64-bit datapath identifier reported by the switch at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwitchId(pub u64);

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl From<u64> for SwitchId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

// ── Roles ───────────────────────────────────────────────────────────────────

/// Controller role as seen by a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
    Equal,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "MASTER",
            Role::Slave => "SLAVE",
            Role::Equal => "EQUAL",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            "equal" => Ok(Role::Equal),
            other => Err(format!("unknown role '{other}' (expected master, slave or equal)")),
        }
    }
}

// ── Ports and features ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDesc {
    pub number: u16,
    pub name: String,
    #[serde(default)]
    pub hw_addr: String,
    #[serde(default)]
    pub config: u32,
    #[serde(default)]
    pub state: u32,
}

impl PortDesc {
    /// Administratively disabled or without link.
    pub fn is_down(&self) -> bool {
        self.config & PORT_CONFIG_DOWN != 0 || self.state & PORT_STATE_LINK_DOWN != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortReason {
    Add,
    Delete,
    Modify,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub datapath_id: SwitchId,
    #[serde(default)]
    pub n_buffers: u32,
    #[serde(default)]
    pub n_tables: u8,
    #[serde(default)]
    pub capabilities: u32,
    #[serde(default)]
    pub ports: Vec<PortDesc>,
}

// ── Statistics ──────────────────────────────────────────────────────────────

/// Switch self-description returned by a description statistics request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Description {
    pub manufacturer: String,
    pub hardware: String,
    pub software: String,
    pub serial_number: String,
    pub datapath: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCounters {
    pub port: u16,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub tx_packets: u64,
    #[serde(default)]
    pub rx_dropped: u64,
    #[serde(default)]
    pub tx_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatsRequestBody {
    Description,
    Port { port: Option<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatsReplyBody {
    Description(Description),
    Port { entries: Vec<PortCounters> },
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    HelloFailed,
    BadRequest,
    BadAction,
    FlowModFailed,
    PortModFailed,
    QueueOpFailed,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::HelloFailed => "HELLO_FAILED",
            ErrorType::BadRequest => "BAD_REQUEST",
            ErrorType::BadAction => "BAD_ACTION",
            ErrorType::FlowModFailed => "FLOW_MOD_FAILED",
            ErrorType::PortModFailed => "PORT_MOD_FAILED",
            ErrorType::QueueOpFailed => "QUEUE_OP_FAILED",
        }
    }

    /// Symbolic name of `code` within this error type.
    pub fn code_name(&self, code: u16) -> Option<&'static str> {
        let table: &[&str] = match self {
            ErrorType::HelloFailed => &["INCOMPATIBLE", "EPERM"],
            ErrorType::BadRequest => &[
                "BAD_VERSION",
                "BAD_TYPE",
                "BAD_STAT",
                "BAD_VENDOR",
                "BAD_SUBTYPE",
                "EPERM",
                "BAD_LEN",
                "BUFFER_EMPTY",
                "BUFFER_UNKNOWN",
            ],
            ErrorType::BadAction => &[
                "BAD_TYPE",
                "BAD_LEN",
                "BAD_VENDOR",
                "BAD_VENDOR_TYPE",
                "BAD_OUT_PORT",
                "BAD_ARGUMENT",
                "EPERM",
                "TOO_MANY",
                "BAD_QUEUE",
            ],
            ErrorType::FlowModFailed => &[
                "ALL_TABLES_FULL",
                "OVERLAP",
                "EPERM",
                "BAD_EMERG_TIMEOUT",
                "BAD_COMMAND",
                "UNSUPPORTED",
            ],
            ErrorType::PortModFailed => &["BAD_PORT", "BAD_HW_ADDR"],
            ErrorType::QueueOpFailed => &["BAD_PORT", "BAD_QUEUE", "EPERM"],
        };
        table.get(usize::from(code)).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub err_type: ErrorType,
    pub code: u16,
}

impl fmt::Display for ErrorMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.err_type.code_name(self.code) {
            Some(name) => write!(f, "{} / {}", self.err_type.as_str(), name),
            None => write!(f, "{} / code {}", self.err_type.as_str(), self.code),
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowCommand {
    Add,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello,
    EchoRequest,
    EchoReply,
    FeaturesRequest,
    FeaturesReply(Features),
    SetConfig { miss_send_len: u16 },
    GetConfigRequest,
    GetConfigReply { miss_send_len: u16 },
    StatsRequest { body: StatsRequestBody },
    StatsReply { body: StatsReplyBody },
    RoleRequest { role: Role },
    RoleReply { role: Role },
    Error(ErrorMsg),
    PortStatus { reason: PortReason, desc: PortDesc },
    PacketIn {
        in_port: u16,
        #[serde(default)]
        data: Vec<u8>,
    },
    PacketOut {
        out_port: u16,
        #[serde(default)]
        data: Vec<u8>,
    },
    /// `wildcard_all` with `Delete` removes every entry in every table.
    FlowMod {
        command: FlowCommand,
        #[serde(default)]
        wildcard_all: bool,
    },
    BarrierRequest,
    BarrierReply,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello => MessageType::Hello,
            Message::EchoRequest => MessageType::EchoRequest,
            Message::EchoReply => MessageType::EchoReply,
            Message::FeaturesRequest => MessageType::FeaturesRequest,
            Message::FeaturesReply(_) => MessageType::FeaturesReply,
            Message::SetConfig { .. } => MessageType::SetConfig,
            Message::GetConfigRequest => MessageType::GetConfigRequest,
            Message::GetConfigReply { .. } => MessageType::GetConfigReply,
            Message::StatsRequest { .. } => MessageType::StatsRequest,
            Message::StatsReply { .. } => MessageType::StatsReply,
            Message::RoleRequest { .. } => MessageType::RoleRequest,
            Message::RoleReply { .. } => MessageType::RoleReply,
            Message::Error(_) => MessageType::Error,
            Message::PortStatus { .. } => MessageType::PortStatus,
            Message::PacketIn { .. } => MessageType::PacketIn,
            Message::PacketOut { .. } => MessageType::PacketOut,
            Message::FlowMod { .. } => MessageType::FlowMod,
            Message::BarrierRequest => MessageType::BarrierRequest,
            Message::BarrierReply => MessageType::BarrierReply,
        }
    }

    /// Delete-all flow-mod used to wipe a newly mastered switch.
    pub fn delete_all_flows() -> Self {
        Message::FlowMod {
            command: FlowCommand::Delete,
            wildcard_all: true,
        }
    }
}

/// Discriminant of [`Message`]; message listeners register per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    Hello,
    EchoRequest,
    EchoReply,
    FeaturesRequest,
    FeaturesReply,
    SetConfig,
    GetConfigRequest,
    GetConfigReply,
    StatsRequest,
    StatsReply,
    RoleRequest,
    RoleReply,
    Error,
    PortStatus,
    PacketIn,
    PacketOut,
    FlowMod,
    BarrierRequest,
    BarrierReply,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Hello => "HELLO",
            MessageType::EchoRequest => "ECHO_REQUEST",
            MessageType::EchoReply => "ECHO_REPLY",
            MessageType::FeaturesRequest => "FEATURES_REQUEST",
            MessageType::FeaturesReply => "FEATURES_REPLY",
            MessageType::SetConfig => "SET_CONFIG",
            MessageType::GetConfigRequest => "GET_CONFIG_REQUEST",
            MessageType::GetConfigReply => "GET_CONFIG_REPLY",
            MessageType::StatsRequest => "STATS_REQUEST",
            MessageType::StatsReply => "STATS_REPLY",
            MessageType::RoleRequest => "ROLE_REQUEST",
            MessageType::RoleReply => "ROLE_REPLY",
            MessageType::Error => "ERROR",
            MessageType::PortStatus => "PORT_STATUS",
            MessageType::PacketIn => "PACKET_IN",
            MessageType::PacketOut => "PACKET_OUT",
            MessageType::FlowMod => "FLOW_MOD",
            MessageType::BarrierRequest => "BARRIER_REQUEST",
            MessageType::BarrierReply => "BARRIER_REPLY",
        };
        f.write_str(name)
    }
}

/// One message plus its transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub xid: Xid,
    pub msg: Message,
}

impl Frame {
    pub fn new(xid: Xid, msg: Message) -> Self {
        Self { xid, msg }
    }

    pub fn message_type(&self) -> MessageType {
        self.msg.message_type()
    }
}
