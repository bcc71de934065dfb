//! User-facing message record and the fixed per-message wire header.
//!
//! A [`Message`] is the unit callers send and receive through
//! [`crate::connection::Connection`]. The runtime stamps in the serial
//! number, flags, and status; callers only ever supply `header` and `data`.

use crate::error::Reason;

/// Classification carried by every in-flight message, mirroring the
/// tlv_type family at the wire level (`MSG_REQ`/`MSG_RSP`/`ONE_WAY_REQ`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Req,
    Rsp,
    OneWay,
}

/// Per-message flags carried in the 16-byte session header.
///
/// Hand-rolled rather than pulled from the `bitflags` crate: three bits
/// don't justify the dependency, and the wire representation is just the
/// raw `u32` anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags(pub u32);

impl MsgFlags {
    pub const REQUEST_READ_RECEIPT: MsgFlags = MsgFlags(1 << 0);
    pub const RSP_FIRST: MsgFlags = MsgFlags(1 << 1);
    pub const RSP_LAST: MsgFlags = MsgFlags(1 << 2);

    pub const fn empty() -> Self {
        MsgFlags(0)
    }

    pub const fn contains(&self, other: MsgFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        MsgFlags(bits)
    }
}

impl std::ops::BitOr for MsgFlags {
    type Output = MsgFlags;
    fn bitor(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MsgFlags {
    fn bitor_assign(&mut self, rhs: MsgFlags) {
        self.0 |= rhs.0;
    }
}

/// Status reported on a delivered message or on `on_msg_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    Ok,
    Error(Reason),
}

/// The 16-byte on-wire session header prefixed to every framed message.
///
/// Layout (network byte order): `dest_session_id:u32`, `serial_num:u64`,
/// `flags:u32`, `receipt_result:u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionHeader {
    pub dest_session_id: u32,
    pub serial_num: u64,
    pub flags: u32,
    pub receipt_result: u32,
}

pub const SESSION_HEADER_LEN: usize = 4 + 8 + 4 + 4;

/// A single application-level message.
///
/// `request` back-references the in-flight request task when this message
/// is a response (`kind == Rsp`); it is `None` for requests and one-way
/// messages.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub header: Vec<u8>,
    pub data: Vec<u8>,
    pub flags: MsgFlags,
    pub serial_num: u64,
    pub request_serial: Option<u64>,
    pub status: MsgStatus,
}

impl Message {
    /// Construct a new outbound request. The serial number is assigned by
    /// the connection on send; callers never stamp it themselves.
    pub fn new_request(header: Vec<u8>, data: Vec<u8>) -> Self {
        Message {
            kind: MessageKind::Req,
            header,
            data,
            flags: MsgFlags::empty(),
            serial_num: 0,
            request_serial: None,
            status: MsgStatus::Ok,
        }
    }

    /// Construct a response to `request_serial`; the connection copies this
    /// serial onto the wire header verbatim (no fresh serial is allocated).
    pub fn new_response(request_serial: u64, header: Vec<u8>, data: Vec<u8>) -> Self {
        Message {
            kind: MessageKind::Rsp,
            header,
            data,
            flags: MsgFlags::empty(),
            serial_num: request_serial,
            request_serial: Some(request_serial),
            status: MsgStatus::Ok,
        }
    }

    /// Construct a one-way message with no response correlation.
    pub fn new_one_way(header: Vec<u8>, data: Vec<u8>) -> Self {
        Message {
            kind: MessageKind::OneWay,
            header,
            data,
            flags: MsgFlags::empty(),
            serial_num: 0,
            request_serial: None,
            status: MsgStatus::Ok,
        }
    }

    pub fn with_read_receipt(mut self) -> Self {
        self.flags |= MsgFlags::REQUEST_READ_RECEIPT;
        self
    }

    pub fn wants_read_receipt(&self) -> bool {
        self.flags.contains(MsgFlags::REQUEST_READ_RECEIPT)
    }
}
