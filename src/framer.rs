//! Wire framing for the session protocol: the fixed 16-byte message header
//! and the setup request/response payloads.
//!
//! Numeric fields are written little-endian via the `write_uintN`/
//! `read_uintN` primitives below, matching the on-wire layout of the
//! protocol this crate implements. The TLV envelope itself (length framing
//! of the whole buffer) is the transport's responsibility; this module only
//! serializes what goes *inside* one TLV payload.

use crate::error::{CoreError, Reason, Result};
use crate::message::{SessionHeader, SESSION_HEADER_LEN};

/// Upper bound on a serialized setup request or response payload.
pub const SETUP_BUFFER_LEN: usize = 3840;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupAction {
    Accept = 0,
    Redirect = 1,
    Reject = 2,
}

impl SetupAction {
    fn from_wire(v: u16) -> Result<Self> {
        match v {
            0 => Ok(SetupAction::Accept),
            1 => Ok(SetupAction::Redirect),
            2 => Ok(SetupAction::Reject),
            other => Err(CoreError::MsgInvalid(format!(
                "unknown setup action discriminant {other}"
            ))),
        }
    }
}

/// Decoded setup request body (`SETUP_REQ`).
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub session_id: u32,
    pub uri: String,
    pub user_context: Vec<u8>,
}

/// Decoded setup response body (`SETUP_RSP`), covering all three actions.
#[derive(Debug, Clone)]
pub enum SetupResponse {
    Accept {
        session_id: u32,
        portals: Vec<String>,
        user_context: Vec<u8>,
    },
    Redirect {
        session_id: u32,
        services: Vec<String>,
    },
    Reject {
        session_id: u32,
        reason: Reason,
        user_context: Vec<u8>,
    },
}

fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn read_u16(buf: &[u8], off: &mut usize) -> Result<u16> {
    let end = *off + 2;
    let bytes: [u8; 2] = buf
        .get(*off..end)
        .ok_or_else(|| CoreError::MsgInvalid("truncated u16 field".into()))?
        .try_into()
        .unwrap();
    *off = end;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32(buf: &[u8], off: &mut usize) -> Result<u32> {
    let end = *off + 4;
    let bytes: [u8; 4] = buf
        .get(*off..end)
        .ok_or_else(|| CoreError::MsgInvalid("truncated u32 field".into()))?
        .try_into()
        .unwrap();
    *off = end;
    Ok(u32::from_le_bytes(bytes))
}

fn read_bytes<'a>(buf: &'a [u8], off: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *off + len;
    let slice = buf
        .get(*off..end)
        .ok_or_else(|| CoreError::MsgInvalid("truncated byte field".into()))?;
    *off = end;
    Ok(slice)
}

/// Stateless codec for the session protocol's header and setup payloads.
pub struct MessageFramer;

impl MessageFramer {
    /// Serialize the fixed 16-byte session header.
    pub fn write_header(hdr: &SessionHeader) -> [u8; SESSION_HEADER_LEN] {
        let mut out = [0u8; SESSION_HEADER_LEN];
        out[0..4].copy_from_slice(&hdr.dest_session_id.to_be_bytes());
        out[4..12].copy_from_slice(&hdr.serial_num.to_be_bytes());
        out[12..16].copy_from_slice(&hdr.flags.to_be_bytes());
        out[16..20].copy_from_slice(&hdr.receipt_result.to_be_bytes());
        out
    }

    /// Parse the fixed 16-byte session header.
    pub fn read_header(buf: &[u8]) -> Result<SessionHeader> {
        if buf.len() < SESSION_HEADER_LEN {
            return Err(CoreError::MsgInvalid(format!(
                "header too short: {} < {SESSION_HEADER_LEN}",
                buf.len()
            )));
        }
        Ok(SessionHeader {
            dest_session_id: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            serial_num: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            flags: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            receipt_result: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }

    /// Serialize a `SETUP_REQ` body: `session_id:u32, uri_len:u16,
    /// user_ctx_len:u16, uri[uri_len], user_ctx[user_ctx_len]`.
    pub fn write_setup_request(
        session_id: u32,
        uri: &str,
        user_context: &[u8],
    ) -> Result<Vec<u8>> {
        let total = 4 + 2 + 2 + uri.len() + user_context.len();
        if total > SETUP_BUFFER_LEN {
            return Err(CoreError::MsgSize {
                size: total,
                limit: SETUP_BUFFER_LEN,
            });
        }
        let mut buf = Vec::with_capacity(total);
        write_u32(&mut buf, session_id);
        write_u16(&mut buf, uri.len() as u16);
        write_u16(&mut buf, user_context.len() as u16);
        buf.extend_from_slice(uri.as_bytes());
        buf.extend_from_slice(user_context);
        Ok(buf)
    }

    /// Parse a `SETUP_REQ` body.
    pub fn read_setup_request(buf: &[u8]) -> Result<SetupRequest> {
        let mut off = 0;
        let session_id = read_u32(buf, &mut off)?;
        let uri_len = read_u16(buf, &mut off)? as usize;
        let ctx_len = read_u16(buf, &mut off)? as usize;
        let uri = String::from_utf8(read_bytes(buf, &mut off, uri_len)?.to_vec())
            .map_err(|e| CoreError::MsgInvalid(format!("uri not utf8: {e}")))?;
        let user_context = read_bytes(buf, &mut off, ctx_len)?.to_vec();
        Ok(SetupRequest {
            session_id,
            uri,
            user_context,
        })
    }

    /// Serialize a `SETUP_RSP` body. Layout: `session_id:u32, action:u16`,
    /// then action-specific payload. REJECT carries `reason:u32` followed
    /// by a length-prefixed user context. ACCEPT/REDIRECT carry
    /// `endpoints_len:u16, user_ctx_len:u16` (REDIRECT's user_ctx_len is
    /// always zero), then each endpoint as `len:u16` + bytes, then the
    /// user context bytes.
    pub fn write_setup_response(
        session_id: u32,
        action: SetupAction,
        endpoints: &[String],
        reason: Option<Reason>,
        user_context: &[u8],
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_u32(&mut buf, session_id);
        write_u16(&mut buf, action as u16);

        match action {
            SetupAction::Reject => {
                write_u32(&mut buf, reason.unwrap_or(Reason::Other(0)).as_wire());
                write_u16(&mut buf, user_context.len() as u16);
                buf.extend_from_slice(user_context);
            }
            SetupAction::Accept | SetupAction::Redirect => {
                write_u16(&mut buf, endpoints.len() as u16);
                write_u16(&mut buf, user_context.len() as u16);
                for ep in endpoints {
                    write_u16(&mut buf, ep.len() as u16);
                    buf.extend_from_slice(ep.as_bytes());
                }
                buf.extend_from_slice(user_context);
            }
        }

        if buf.len() > SETUP_BUFFER_LEN {
            return Err(CoreError::MsgSize {
                size: buf.len(),
                limit: SETUP_BUFFER_LEN,
            });
        }
        Ok(buf)
    }

    /// Parse a `SETUP_RSP` body (inverse of [`Self::write_setup_response`]).
    pub fn read_setup_response(buf: &[u8]) -> Result<SetupResponse> {
        let mut off = 0;
        let session_id = read_u32(buf, &mut off)?;
        let action = SetupAction::from_wire(read_u16(buf, &mut off)?)?;

        match action {
            SetupAction::Reject => {
                let reason = Reason::from_wire(read_u32(buf, &mut off)?);
                let ctx_len = read_u16(buf, &mut off)? as usize;
                let user_context = read_bytes(buf, &mut off, ctx_len)?.to_vec();
                Ok(SetupResponse::Reject {
                    session_id,
                    reason,
                    user_context,
                })
            }
            SetupAction::Accept => {
                let endpoints_len = read_u16(buf, &mut off)? as usize;
                let ctx_len = read_u16(buf, &mut off)? as usize;
                let mut portals = Vec::with_capacity(endpoints_len);
                for _ in 0..endpoints_len {
                    let len = read_u16(buf, &mut off)? as usize;
                    let s = String::from_utf8(read_bytes(buf, &mut off, len)?.to_vec())
                        .map_err(|e| CoreError::MsgInvalid(format!("portal not utf8: {e}")))?;
                    portals.push(s);
                }
                let user_context = read_bytes(buf, &mut off, ctx_len)?.to_vec();
                Ok(SetupResponse::Accept {
                    session_id,
                    portals,
                    user_context,
                })
            }
            SetupAction::Redirect => {
                let endpoints_len = read_u16(buf, &mut off)? as usize;
                let _ctx_len = read_u16(buf, &mut off)? as usize;
                let mut services = Vec::with_capacity(endpoints_len);
                for _ in 0..endpoints_len {
                    let len = read_u16(buf, &mut off)? as usize;
                    let s = String::from_utf8(read_bytes(buf, &mut off, len)?.to_vec())
                        .map_err(|e| CoreError::MsgInvalid(format!("service not utf8: {e}")))?;
                    services.push(s);
                }
                Ok(SetupResponse::Redirect {
                    session_id,
                    services,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = SessionHeader {
            dest_session_id: 42,
            serial_num: 0xdead_beef_0000_0001,
            flags: 0b101,
            receipt_result: 7,
        };
        let wire = MessageFramer::write_header(&hdr);
        let back = MessageFramer::read_header(&wire).unwrap();
        assert_eq!(hdr, back);
    }

    #[test]
    fn setup_request_round_trip() {
        let uri = "rdma://127.0.0.1:2061";
        let ctx = b"hello-ctx".to_vec();
        let wire = MessageFramer::write_setup_request(7, uri, &ctx).unwrap();
        let back = MessageFramer::read_setup_request(&wire).unwrap();
        assert_eq!(back.session_id, 7);
        assert_eq!(back.uri, uri);
        assert_eq!(back.user_context, ctx);
    }

    #[test]
    fn setup_request_too_large_fails() {
        let huge = vec![0u8; SETUP_BUFFER_LEN];
        let err = MessageFramer::write_setup_request(1, "x", &huge).unwrap_err();
        assert!(matches!(err, CoreError::MsgSize { .. }));
    }

    #[test]
    fn setup_response_accept_with_portals_round_trip() {
        let portals = vec!["rdma://*:3001".to_string(), "rdma://*:3002".to_string()];
        let ctx = b"srv-ctx".to_vec();
        let wire = MessageFramer::write_setup_response(
            5,
            SetupAction::Accept,
            &portals,
            None,
            &ctx,
        )
        .unwrap();
        match MessageFramer::read_setup_response(&wire).unwrap() {
            SetupResponse::Accept {
                session_id,
                portals: p,
                user_context,
            } => {
                assert_eq!(session_id, 5);
                assert_eq!(p, portals);
                assert_eq!(user_context, ctx);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn setup_response_reject_round_trip() {
        let wire = MessageFramer::write_setup_response(
            9,
            SetupAction::Reject,
            &[],
            Some(Reason::InvalidSession),
            b"bad auth",
        )
        .unwrap();
        match MessageFramer::read_setup_response(&wire).unwrap() {
            SetupResponse::Reject {
                session_id,
                reason,
                user_context,
            } => {
                assert_eq!(session_id, 9);
                assert_eq!(reason, Reason::InvalidSession);
                assert_eq!(user_context, b"bad auth");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn setup_response_redirect_round_trip() {
        let services = vec!["rdma://B:2061".to_string()];
        let wire =
            MessageFramer::write_setup_response(3, SetupAction::Redirect, &services, None, &[])
                .unwrap();
        match MessageFramer::read_setup_response(&wire).unwrap() {
            SetupResponse::Redirect {
                session_id,
                services: s,
            } => {
                assert_eq!(session_id, 3);
                assert_eq!(s, services);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
