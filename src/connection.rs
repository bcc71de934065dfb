//! Per-(session, context) logical channel: outbound queueing, the transmit
//! pump, the FIN teardown handshake, and the cancel protocol.
//!
//! Grounded on the FIN/cancel state handling scattered through
//! `xio_session.c` (the `xio_disconnect`/`xio_on_fin_*` family) and on
//! the connection lookup scan described for `xio_session_find_conn_by_ctx`.
//! Each connection owns an intake task that reads framed buffers off its
//! [`crate::transport::Transport`] and, since the runtime is single-threaded
//! per context, feeds them back to the owning [`crate::session::Session`]
//! one at a time, synchronously, from that task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, Reason, Result};
use crate::message::{Message, MessageKind, MsgFlags, MsgStatus, SessionHeader};
use crate::pool::{Task, TaskPool, TaskState};
use crate::session::Session;
use crate::transport::{Transport, TransportEvent};

/// Stable identity for a connection, used as the key into a session's
/// connection list and into the process-wide connection registry.
pub type ConnectionId = u64;

/// Connection-level state, folding the base lifecycle
/// (`INIT`/`ONLINE`/`DISCONNECT`/`CLOSE`) together with the FIN
/// sub-states (`FIN_WAIT`/`ACKING`) that only apply while ONLINE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Online,
    FinWait,
    Acking,
    Disconnect,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlvType {
    SetupReq = 0,
    SetupRsp = 1,
    MsgReq = 2,
    MsgRsp = 3,
    OneWayReq = 4,
    FinReq = 6,
    FinRsp = 7,
    CancelReq = 8,
    CancelRsp = 9,
}

impl TlvType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(TlvType::SetupReq),
            1 => Ok(TlvType::SetupRsp),
            2 => Ok(TlvType::MsgReq),
            3 => Ok(TlvType::MsgRsp),
            4 => Ok(TlvType::OneWayReq),
            6 => Ok(TlvType::FinReq),
            7 => Ok(TlvType::FinRsp),
            8 => Ok(TlvType::CancelReq),
            9 => Ok(TlvType::CancelRsp),
            other => Err(CoreError::MsgInvalid(format!("unknown tlv_type {other}"))),
        }
    }
}

fn envelope(tlv: TlvType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(tlv as u8);
    out.extend_from_slice(payload);
    out
}

fn encode_data_payload(hdr: &SessionHeader, header: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = crate::framer::MessageFramer::write_header(hdr).to_vec();
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(header);
    out.extend_from_slice(data);
    out
}

fn decode_data_payload(buf: &[u8]) -> Result<(SessionHeader, Vec<u8>, Vec<u8>)> {
    let hdr = crate::framer::MessageFramer::read_header(buf)?;
    let rest = &buf[crate::message::SESSION_HEADER_LEN..];
    if rest.len() < 4 {
        return Err(CoreError::MsgInvalid("truncated data payload length".into()));
    }
    let hdr_len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
    let rest = &rest[4..];
    if rest.len() < hdr_len {
        return Err(CoreError::MsgInvalid("truncated message header bytes".into()));
    }
    let (header, data) = rest.split_at(hdr_len);
    Ok((hdr, header.to_vec(), data.to_vec()))
}

fn encode_control_frame(dest_session_id: u32, serial_num: u64, extra: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&dest_session_id.to_be_bytes());
    out.extend_from_slice(&serial_num.to_be_bytes());
    out.extend_from_slice(&extra.to_be_bytes());
    out
}

fn decode_control_frame(buf: &[u8]) -> Result<(u32, u64, u32)> {
    if buf.len() < 16 {
        return Err(CoreError::MsgInvalid("truncated control frame".into()));
    }
    let dest = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let serial = u64::from_be_bytes(buf[4..12].try_into().unwrap());
    let extra = u32::from_be_bytes(buf[12..16].try_into().unwrap());
    Ok((dest, serial, extra))
}

/// Result codes carried in a CANCEL-RESPONSE's `extra` field. Distinct from
/// [`Reason`], which only covers session-level setup/disconnect reasons.
const CANCEL_NOT_FOUND: u32 = 0;
const CANCEL_CANCELED: u32 = 1;

enum OutboundItem {
    Data {
        header: SessionHeader,
        header_bytes: Vec<u8>,
        data_bytes: Vec<u8>,
        tlv: TlvType,
    },
    Raw(Vec<u8>),
}

/// Per-(session, context) endpoint.
pub struct Connection {
    pub id: ConnectionId,
    session: Weak<Session>,
    pub session_id: u32,
    pub context_id: u64,
    pub conn_idx: u32,
    transport: Arc<dyn Transport>,
    pool: TaskPool,
    config: CoreConfig,
    state: AtomicU8,
    outbound: Mutex<VecDeque<OutboundItem>>,
    /// Requests/one-ways this side sent, awaiting a response or receipt.
    outbound_inflight: Mutex<HashMap<u64, Task>>,
    /// Requests this side received, awaiting an application response.
    inbound_inflight: Mutex<HashMap<u64, Task>>,
    disable_teardown: std::sync::atomic::AtomicBool,
}

const ST_INIT: u8 = 0;
const ST_ONLINE: u8 = 1;
const ST_FIN_WAIT: u8 = 2;
const ST_ACKING: u8 = 3;
const ST_DISCONNECT: u8 = 4;
const ST_CLOSE: u8 = 5;

fn encode_state(s: ConnState) -> u8 {
    match s {
        ConnState::Init => ST_INIT,
        ConnState::Online => ST_ONLINE,
        ConnState::FinWait => ST_FIN_WAIT,
        ConnState::Acking => ST_ACKING,
        ConnState::Disconnect => ST_DISCONNECT,
        ConnState::Close => ST_CLOSE,
    }
}

fn decode_state(s: u8) -> ConnState {
    match s {
        ST_INIT => ConnState::Init,
        ST_ONLINE => ConnState::Online,
        ST_FIN_WAIT => ConnState::FinWait,
        ST_ACKING => ConnState::Acking,
        ST_DISCONNECT => ConnState::Disconnect,
        _ => ConnState::Close,
    }
}

impl Connection {
    /// Construct a connection bound to an already-established transport and
    /// spawn its intake loop. `session` is a weak back-reference: the
    /// session owns the connection's `Arc`, so a strong reference here
    /// would leak both.
    pub fn spawn(
        id: ConnectionId,
        session: Weak<Session>,
        session_id: u32,
        context_id: u64,
        conn_idx: u32,
        transport: Arc<dyn Transport>,
        pool: TaskPool,
        config: CoreConfig,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection {
            id,
            session,
            session_id,
            context_id,
            conn_idx,
            transport,
            pool,
            config,
            state: AtomicU8::new(ST_ONLINE),
            outbound: Mutex::new(VecDeque::new()),
            outbound_inflight: Mutex::new(HashMap::new()),
            inbound_inflight: Mutex::new(HashMap::new()),
            disable_teardown: std::sync::atomic::AtomicBool::new(false),
        });
        let task_conn = conn.clone();
        tokio::spawn(async move { Connection::intake_loop(task_conn).await });
        conn
    }

    pub fn peer_uri(&self) -> &str {
        self.transport.peer_uri()
    }

    pub fn state(&self) -> ConnState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnState) {
        self.state.store(encode_state(s), Ordering::Release);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    // ---- outbound API -------------------------------------------------

    /// Enqueue a request; stamps a fresh serial number from the owning
    /// session's counter. Fails `INVALID_STATE` once past DISCONNECT.
    pub async fn send_request(&self, mut msg: Message) -> Result<u64> {
        self.require_sendable()?;
        let session = self.session().ok_or(CoreError::SessionDisconnected)?;
        let serial = session.next_serial();
        msg.serial_num = serial;
        msg.kind = MessageKind::Req;
        self.enqueue_data(&msg, TlvType::MsgReq)?;
        let task = crate::pool::acquire_for_message(&self.pool, &msg)?;
        task.set_serial_num(serial);
        task.set_connection_id(self.id as usize);
        task.set_state(TaskState::Queued);
        self.outbound_inflight.lock().insert(serial, task);
        self.xmit_msgs().await?;
        Ok(serial)
    }

    /// Send a response to a previously-delivered request. `request_serial`
    /// must match an inbound task this connection is still holding.
    pub async fn send_response(&self, msg: Message) -> Result<()> {
        self.require_sendable()?;
        let serial = msg
            .request_serial
            .ok_or(CoreError::InvalidState("response has no request_serial"))?;
        if !self.inbound_inflight.lock().contains_key(&serial) {
            return Err(CoreError::MsgNotFound { serial });
        }
        self.enqueue_data(&msg, TlvType::MsgRsp)?;
        self.xmit_msgs().await?;
        // The inbound task is released once the send actually completes;
        // the loopback transport has no async completion signal distinct
        // from the send call itself, so release it here.
        if let Some(task) = self.inbound_inflight.lock().remove(&serial) {
            self.pool.release(&task);
        }
        if let Some(session) = self.session() {
            session.notify_send_complete(serial);
        }
        Ok(())
    }

    /// Send a one-way message. If `REQUEST_READ_RECEIPT` is set the backing
    /// task is retained in `outbound_inflight` until the receipt arrives.
    pub async fn send_one_way(&self, mut msg: Message) -> Result<u64> {
        self.require_sendable()?;
        let session = self.session().ok_or(CoreError::SessionDisconnected)?;
        let serial = session.next_serial();
        msg.serial_num = serial;
        msg.kind = MessageKind::OneWay;
        let wants_receipt = msg.wants_read_receipt();
        self.enqueue_data(&msg, TlvType::OneWayReq)?;
        if wants_receipt {
            let task = crate::pool::acquire_for_message(&self.pool, &msg)?;
            task.set_serial_num(serial);
            task.set_state(TaskState::Queued);
            self.outbound_inflight.lock().insert(serial, task);
        }
        self.xmit_msgs().await?;
        Ok(serial)
    }

    /// Whether this connection currently holds an inbound task for `serial`
    /// (a request received but not yet answered).
    pub fn has_inbound(&self, serial: u64) -> bool {
        self.inbound_inflight.lock().contains_key(&serial)
    }

    /// Return a delivered message's backing task to the pool, dropping the
    /// hold this connection placed on it.
    pub fn release_msg(&self, serial: u64) {
        if let Some(task) = self.inbound_inflight.lock().remove(&serial) {
            self.pool.release(&task);
        }
    }

    /// Release a response this side received (i.e. the task backing the
    /// original outbound request it answers).
    pub fn release_response(&self, serial: u64) {
        if let Some(task) = self.outbound_inflight.lock().remove(&serial) {
            self.pool.release(&task);
        }
    }

    /// Begin graceful teardown: send FIN_REQ and move to FIN_WAIT. The
    /// transition to CLOSE happens when FIN_RSP arrives on the intake loop.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() != ConnState::Online {
            return Err(CoreError::InvalidState("disconnect() requires ONLINE"));
        }
        self.set_state(ConnState::FinWait);
        let frame = envelope(
            TlvType::FinReq,
            &encode_control_frame(self.session_id, 0, 0),
        );
        self.outbound.lock().push_back(OutboundItem::Raw(frame));
        self.xmit_msgs().await
    }

    /// Send a raw `SETUP_REQ` payload (already framer-encoded by the session).
    pub async fn send_setup_request(&self, payload: Vec<u8>) -> Result<()> {
        let frame = envelope(TlvType::SetupReq, &payload);
        self.outbound.lock().push_back(OutboundItem::Raw(frame));
        self.xmit_msgs().await
    }

    /// Send a raw `SETUP_RSP` payload (already framer-encoded by the session).
    pub async fn send_setup_response(&self, payload: Vec<u8>) -> Result<()> {
        let frame = envelope(TlvType::SetupRsp, &payload);
        self.outbound.lock().push_back(OutboundItem::Raw(frame));
        self.xmit_msgs().await
    }

    /// Drain the outbound queue, framing each entry and handing it to the
    /// transport. The loopback transport applies no flow control, so this
    /// always drains the queue fully in one pass.
    pub async fn xmit_msgs(&self) -> Result<()> {
        loop {
            let item = self.outbound.lock().pop_front();
            let item = match item {
                Some(i) => i,
                None => return Ok(()),
            };
            let wire = match item {
                OutboundItem::Data {
                    header,
                    header_bytes,
                    data_bytes,
                    tlv,
                } => {
                    let payload = encode_data_payload(&header, &header_bytes, &data_bytes);
                    envelope(tlv, &payload)
                }
                OutboundItem::Raw(bytes) => bytes,
            };
            self.transport.send(wire).await?;
        }
    }

    fn enqueue_data(&self, msg: &Message, tlv: TlvType) -> Result<()> {
        let mut outbound = self.outbound.lock();
        if outbound.len() >= self.config.queue_depth {
            return Err(CoreError::NoResources);
        }
        let flags = if tlv == TlvType::MsgRsp && msg.wants_read_receipt() {
            msg.flags | MsgFlags::RSP_FIRST | MsgFlags::RSP_LAST
        } else {
            msg.flags
        };
        let header = SessionHeader {
            dest_session_id: self.session_id,
            serial_num: msg.serial_num,
            flags: flags.bits(),
            receipt_result: 0,
        };
        outbound.push_back(OutboundItem::Data {
            header,
            header_bytes: msg.header.clone(),
            data_bytes: msg.data.clone(),
            tlv,
        });
        Ok(())
    }

    fn require_sendable(&self) -> Result<()> {
        match self.state() {
            ConnState::Online => Ok(()),
            _ => Err(CoreError::InvalidState(
                "connection is past DISCONNECT or not yet ONLINE",
            )),
        }
    }

    pub fn set_disable_teardown(&self, disabled: bool) {
        self.disable_teardown
            .store(disabled, Ordering::Release);
    }

    // ---- inbound handling ----------------------------------------------

    async fn intake_loop(conn: Arc<Connection>) {
        let poll_timeout = std::time::Duration::from_millis(conn.config.poll_timeout_ms.max(1));
        loop {
            match tokio::time::timeout(poll_timeout, conn.transport.recv()).await {
                Ok(Some(TransportEvent::Data(buf))) => {
                    if let Err(e) = conn.handle_inbound(&buf).await {
                        warn!(conn_id = conn.id, error = %e, "malformed inbound frame");
                        if let Some(session) = conn.session() {
                            session.notify_msg_error(0, Reason::Other(0));
                        }
                    }
                }
                Ok(Some(TransportEvent::PeerClosed)) | Ok(None) => {
                    conn.on_transport_disconnected().await;
                    return;
                }
                Ok(Some(TransportEvent::Failed(reason))) => {
                    conn.on_transport_failed(&reason).await;
                    return;
                }
                Err(_elapsed) => {
                    // No transport activity within the poll interval; loop
                    // back around, mirroring the original context loop's
                    // periodic re-check between blocking waits.
                }
            }
        }
    }

    async fn handle_inbound(&self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(CoreError::MsgInvalid("empty frame".into()));
        }
        let tlv = TlvType::from_byte(buf[0])?;
        let payload = &buf[1..];
        let session = match self.session() {
            Some(s) => s,
            None => return Ok(()),
        };

        match tlv {
            TlvType::SetupReq | TlvType::SetupRsp => {
                session.handle_setup_frame(self.id, tlv == TlvType::SetupReq, payload);
            }
            TlvType::MsgReq => {
                let (hdr, header, data) = decode_data_payload(payload)?;
                let task = match self.pool.acquire(header.len() + data.len()) {
                    Ok(t) => t,
                    Err(_) => {
                        session.notify_error(Reason::NoResources);
                        return Ok(());
                    }
                };
                task.set_serial_num(hdr.serial_num);
                task.set_state(TaskState::Inflight);
                self.inbound_inflight.lock().insert(hdr.serial_num, task);
                let msg = Message {
                    kind: MessageKind::Req,
                    header,
                    data,
                    flags: MsgFlags::from_bits(hdr.flags),
                    serial_num: hdr.serial_num,
                    request_serial: None,
                    status: MsgStatus::Ok,
                };
                trace!(conn_id = self.id, serial = hdr.serial_num, "inbound request");
                session.handle_msg(self.id, msg);
            }
            TlvType::OneWayReq => {
                let (hdr, header, data) = decode_data_payload(payload)?;
                let wants_receipt = MsgFlags::from_bits(hdr.flags).contains(MsgFlags::REQUEST_READ_RECEIPT);
                let msg = Message {
                    kind: MessageKind::OneWay,
                    header,
                    data,
                    flags: MsgFlags::from_bits(hdr.flags),
                    serial_num: hdr.serial_num,
                    request_serial: None,
                    status: MsgStatus::Ok,
                };
                session.handle_msg(self.id, msg);
                if wants_receipt {
                    // `with_read_receipt()` here is what tags the frame
                    // RSP_FIRST|RSP_LAST in `enqueue_data` below, so the
                    // peer recognizes it as a receipt rather than a real
                    // response with no body.
                    let receipt =
                        Message::new_response(hdr.serial_num, Vec::new(), Vec::new())
                            .with_read_receipt();
                    self.enqueue_data(&receipt, TlvType::MsgRsp)?;
                    self.xmit_msgs().await?;
                }
            }
            TlvType::MsgRsp => {
                let (hdr, header, data) = decode_data_payload(payload)?;
                let flags = MsgFlags::from_bits(hdr.flags);
                let is_receipt_only =
                    flags.contains(MsgFlags::RSP_FIRST) && header.is_empty() && data.is_empty();
                let msg = Message {
                    kind: MessageKind::Rsp,
                    header,
                    data,
                    flags,
                    serial_num: hdr.serial_num,
                    request_serial: Some(hdr.serial_num),
                    status: MsgStatus::Ok,
                };
                if is_receipt_only {
                    session.handle_delivered(self.id, msg);
                } else {
                    if let Some(task) = self.outbound_inflight.lock().remove(&hdr.serial_num) {
                        self.pool.release(&task);
                    }
                    session.handle_response(self.id, msg);
                }
            }
            TlvType::FinReq => {
                let (dest, _serial, _extra) = decode_control_frame(payload)?;
                let _ = dest;
                self.set_state(ConnState::Acking);
                let rsp = envelope(
                    TlvType::FinRsp,
                    &encode_control_frame(self.session_id, 0, 0),
                );
                self.outbound.lock().push_back(OutboundItem::Raw(rsp));
                self.xmit_msgs().await?;
                self.set_state(ConnState::Close);
                session.notify_conn_closed(self.id);
            }
            TlvType::FinRsp => {
                self.set_state(ConnState::Close);
                session.notify_conn_closed(self.id);
            }
            TlvType::CancelReq => {
                let (_dest, serial, _extra) = decode_control_frame(payload)?;
                if self.inbound_inflight.lock().contains_key(&serial) {
                    session.handle_cancel_request(self.id, serial);
                } else {
                    let rsp = envelope(
                        TlvType::CancelRsp,
                        &encode_control_frame(self.session_id, serial, CANCEL_NOT_FOUND),
                    );
                    self.outbound.lock().push_back(OutboundItem::Raw(rsp));
                    self.xmit_msgs().await?;
                }
            }
            TlvType::CancelRsp => {
                let (_dest, serial, result) = decode_control_frame(payload)?;
                let canceled = result == CANCEL_CANCELED;
                if canceled {
                    if let Some(task) = self.outbound_inflight.lock().remove(&serial) {
                        self.pool.release(&task);
                    }
                }
                session.handle_cancel_response(self.id, serial, canceled);
            }
        }
        Ok(())
    }

    /// Reply to a CANCEL-REQUEST: `canceled` true releases the matching
    /// inbound task and reports `MSG_CANCELED`, false leaves it in flight.
    pub async fn send_cancel_response(&self, serial: u64, canceled: bool) -> Result<()> {
        if canceled {
            if let Some(task) = self.inbound_inflight.lock().remove(&serial) {
                self.pool.release(&task);
            }
        }
        let result = if canceled { CANCEL_CANCELED } else { CANCEL_NOT_FOUND };
        let frame = envelope(
            TlvType::CancelRsp,
            &encode_control_frame(self.session_id, serial, result),
        );
        self.outbound.lock().push_back(OutboundItem::Raw(frame));
        self.xmit_msgs().await
    }

    /// Send a CANCEL-REQUEST for an in-flight outbound request.
    pub async fn cancel_request(&self, serial: u64) -> Result<()> {
        if !self.outbound_inflight.lock().contains_key(&serial) {
            return Err(CoreError::MsgNotFound { serial });
        }
        let frame = envelope(
            TlvType::CancelReq,
            &encode_control_frame(self.session_id, serial, 0),
        );
        self.outbound.lock().push_back(OutboundItem::Raw(frame));
        self.xmit_msgs().await
    }

    async fn on_transport_disconnected(&self) {
        if self.state() != ConnState::Close {
            self.set_state(ConnState::Disconnect);
        }
        if let Some(session) = self.session() {
            session.notify_conn_disconnected(self.id, Reason::SessionDisconnected);
        }
    }

    async fn on_transport_failed(&self, reason: &str) {
        self.set_state(ConnState::Disconnect);
        debug!(conn_id = self.id, %reason, "transport failure");
        if let Some(session) = self.session() {
            session.notify_conn_error(self.id, reason.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_round_trip() {
        let wire = encode_control_frame(42, 7, 9);
        let (dest, serial, extra) = decode_control_frame(&wire).unwrap();
        assert_eq!(dest, 42);
        assert_eq!(serial, 7);
        assert_eq!(extra, 9);
    }

    #[test]
    fn data_payload_round_trip() {
        let hdr = SessionHeader {
            dest_session_id: 3,
            serial_num: 99,
            flags: 1,
            receipt_result: 0,
        };
        let wire = encode_data_payload(&hdr, b"header", b"data-bytes");
        let (back_hdr, header, data) = decode_data_payload(&wire).unwrap();
        assert_eq!(back_hdr, hdr);
        assert_eq!(header, b"header");
        assert_eq!(data, b"data-bytes");
    }
}
