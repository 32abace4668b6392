//! # Protocol Negotiation
//!
//! Agrees on the application protocol of a freshly opened stream before any
//! application bytes flow.
//!
//! Every line is a u16 big-endian length (counting the trailing newline)
//! followed by the UTF-8 text and `\n`.
//!
//! ```text
//! initiator                          responder
//!   /multistream/1.0.0
//!   /meshsub/1.1.0          ──►
//!   /ipfs/id/1.0.0
//!   <empty line>
//!                           ◄──      /multistream/1.0.0
//!                                    /meshsub/1.1.0     (or "na")
//! ```
//!
//! The initiator sends all proposals at once, most preferred first. The
//! responder answers with the first one it supports. On `na` both sides
//! drop the stream; the connection is unaffected.

use std::time::Duration;

use tracing::trace;

use crate::connection::Stream;
use crate::error::NegotiationError;

pub const MULTISTREAM_HEADER: &str = "/multistream/1.0.0";

const NOT_AVAILABLE: &str = "na";

pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Most proposals a responder will read.
pub const MAX_PROPOSALS: usize = 16;

/// Longest protocol id, excluding the newline.
pub const MAX_PROTOCOL_LEN: usize = 1024;

fn encode_line(out: &mut Vec<u8>, line: &str) {
    let len = (line.len() + 1) as u16;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
}

async fn read_line(stream: &mut Stream) -> Result<String, NegotiationError> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_PROTOCOL_LEN + 1 {
        return Err(NegotiationError::Malformed(format!("line length {len}")));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    if buf.pop() != Some(b'\n') {
        return Err(NegotiationError::Malformed("line not newline-terminated".into()));
    }
    String::from_utf8(buf).map_err(|_| NegotiationError::Malformed("line is not UTF-8".into()))
}

fn validate_protocol(protocol: &str) -> Result<(), NegotiationError> {
    if protocol.is_empty()
        || protocol.len() > MAX_PROTOCOL_LEN
        || protocol == NOT_AVAILABLE
        || protocol.contains('\n')
    {
        return Err(NegotiationError::Malformed(format!("invalid protocol id {protocol:?}")));
    }
    Ok(())
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, NegotiationError>>,
) -> Result<T, NegotiationError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| NegotiationError::NegotiationTimeout)?
}

/// Propose `protocols` in preference order and return the one the remote
/// picked.
pub async fn select_outbound(
    stream: &mut Stream,
    protocols: &[&str],
    timeout: Duration,
) -> Result<String, NegotiationError> {
    if protocols.is_empty() || protocols.len() > MAX_PROPOSALS {
        return Err(NegotiationError::Malformed(format!(
            "{} proposals",
            protocols.len()
        )));
    }
    for protocol in protocols {
        validate_protocol(protocol)?;
    }

    with_timeout(timeout, async {
        let mut out = Vec::new();
        encode_line(&mut out, MULTISTREAM_HEADER);
        for protocol in protocols {
            encode_line(&mut out, protocol);
        }
        encode_line(&mut out, "");
        stream.write_all(&out).await?;

        let header = read_line(stream).await?;
        if header != MULTISTREAM_HEADER {
            return Err(NegotiationError::Malformed(format!("unexpected header {header:?}")));
        }
        let answer = read_line(stream).await?;
        if answer == NOT_AVAILABLE {
            return Err(NegotiationError::NoCommonProtocol);
        }
        if !protocols.contains(&answer.as_str()) {
            return Err(NegotiationError::Malformed(format!(
                "remote selected unproposed protocol {answer:?}"
            )));
        }
        trace!(protocol = %answer, "negotiated outbound stream");
        Ok(answer)
    })
    .await
}

/// Read the remote's proposals and accept the first one in `supported`.
///
/// On [`NegotiationError::NoCommonProtocol`] the rejection has been sent and
/// the write side closed; the caller just drops the stream.
pub async fn select_inbound(
    stream: &mut Stream,
    supported: &[&str],
    timeout: Duration,
) -> Result<String, NegotiationError> {
    with_timeout(timeout, async {
        let header = read_line(stream).await?;
        if header != MULTISTREAM_HEADER {
            return Err(NegotiationError::Malformed(format!("unexpected header {header:?}")));
        }

        let mut proposals = Vec::new();
        loop {
            let line = read_line(stream).await?;
            if line.is_empty() {
                break;
            }
            if proposals.len() == MAX_PROPOSALS {
                return Err(NegotiationError::Malformed("too many proposals".into()));
            }
            proposals.push(line);
        }

        let chosen = proposals
            .iter()
            .find(|p| supported.contains(&p.as_str()))
            .cloned();

        let mut out = Vec::new();
        encode_line(&mut out, MULTISTREAM_HEADER);
        match chosen {
            Some(protocol) => {
                encode_line(&mut out, &protocol);
                stream.write_all(&out).await?;
                trace!(protocol = %protocol, "negotiated inbound stream");
                Ok(protocol)
            }
            None => {
                encode_line(&mut out, NOT_AVAILABLE);
                stream.write_all(&out).await?;
                stream.close();
                trace!(?proposals, "no common protocol");
                Err(NegotiationError::NoCommonProtocol)
            }
        }
    })
    .await
}
