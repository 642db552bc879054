//! IMAP transport and session operations
//!
//! Timeout-bounded wrappers around `async-imap` operations. All network
//! calls use TLS; timeouts are supplied by the caller (the Connection Pool
//! and IDLE Listener own the specific deadlines named in `spec.md` §5).

use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::{Handle as IdleHandle, IdleResponse};
use async_imap::types::Fetch;
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::errors::{AppError, AppResult};
use crate::models::{Credentials, MessageRecord};

/// Authenticated IMAP session over TLS.
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;
/// A session mid-IDLE; `done()` hands the underlying session back.
pub type ImapIdle = IdleHandle<tokio_rustls::client::TlsStream<TcpStream>>;

/// Connect to `host:port` and authenticate with `credentials`.
///
/// Sequence: TCP connect, TLS handshake against the system root store,
/// read the IMAP greeting, then `LOGIN`. All four phases share the single
/// `deadline` budget passed in (the pool derives this from `imap_timeout`).
///
/// # Errors
///
/// - `Timeout` if any phase exceeds `deadline`
/// - `InvalidCredentials` if `LOGIN` is rejected
/// - `UpstreamUnavailable` for TCP/TLS/greeting failures
pub async fn connect_authenticated(
    host: &str,
    port: u16,
    credentials: &Credentials,
    deadline: Duration,
) -> AppResult<ImapSession> {
    let tcp = timeout(deadline, TcpStream::connect((host, port)))
        .await
        .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|e| AppError::UpstreamUnavailable(format!("tcp connect failed: {e}")))
        })?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| AppError::InvalidRequest("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(deadline, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|e| AppError::UpstreamUnavailable(format!("TLS handshake failed: {e}")))
        })?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(deadline, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|e| AppError::UpstreamUnavailable(format!("IMAP greeting failed: {e}")))
        })?;

    if greeting.is_none() {
        return Err(AppError::UpstreamUnavailable(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = credentials.password.expose_secret();
    timeout(deadline, client.login(credentials.username.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    AppError::InvalidCredentials(msg)
                } else {
                    AppError::UpstreamUnavailable(msg)
                }
            })
        })
}

/// Liveness probe: send `NOOP` and confirm a response arrives within `deadline`.
pub async fn noop(session: &mut ImapSession, deadline: Duration) -> AppResult<()> {
    timeout(deadline, session.noop())
        .await
        .map_err(|_| AppError::Timeout("NOOP timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamUnavailable(format!("NOOP failed: {e}"))))
}

/// `SELECT` a mailbox read-write and return its `UIDVALIDITY`.
pub async fn select_mailbox(
    session: &mut ImapSession,
    mailbox: &str,
    deadline: Duration,
) -> AppResult<u32> {
    let selected = timeout(deadline, session.select(mailbox))
        .await
        .map_err(|_| AppError::Timeout(format!("SELECT timed out for mailbox '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::NotFound(format!("cannot select mailbox '{mailbox}': {e}")))
        })?;
    selected
        .uid_validity
        .ok_or_else(|| AppError::Internal("mailbox missing UIDVALIDITY".to_owned()))
}

/// Fetch every UID strictly greater than `since_uid`, ascending.
///
/// Used by the IDLE Listener to compute the delta range `(last_seen_uid, *]`
/// from `spec.md` §4.C step 3.
pub async fn uids_since(
    session: &mut ImapSession,
    since_uid: u32,
    deadline: Duration,
) -> AppResult<Vec<u32>> {
    let query = format!("{}:*", since_uid.saturating_add(1));
    let stream = timeout(deadline, session.uid_search(&query))
        .await
        .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamUnavailable(format!("uid search failed: {e}"))))?;
    let mut uids: Vec<u32> = stream.into_iter().filter(|uid| *uid > since_uid).collect();
    uids.sort_unstable();
    Ok(uids)
}

/// Fetch envelope headers and flags for one UID into a [`MessageRecord`].
pub async fn fetch_envelope(
    session: &mut ImapSession,
    account_id: uuid::Uuid,
    folder: &str,
    uidvalidity: u32,
    uid: u32,
    deadline: Duration,
) -> AppResult<MessageRecord> {
    let stream = timeout(
        deadline,
        session.uid_fetch(
            uid.to_string(),
            "UID FLAGS BODY.PEEK[HEADER.FIELDS (DATE FROM SUBJECT)]",
        ),
    )
    .await
    .map_err(|_| AppError::Timeout("envelope fetch timed out".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::UpstreamUnavailable(format!("envelope fetch failed: {e}"))))?;

    let fetches: Vec<Fetch> = timeout(deadline, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("envelope fetch stream timed out".to_owned()))
        .and_then(|r| {
            r.map_err(|e| AppError::UpstreamUnavailable(format!("envelope fetch stream failed: {e}")))
        })?;

    let fetch = fetches
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))?;

    let headers = fetch
        .header()
        .map(parse_header_fields)
        .unwrap_or_default();
    let flags = fetch.flags().map(|flag| format!("{flag:?}")).collect();

    Ok(MessageRecord {
        account_id,
        folder: folder.to_owned(),
        uidvalidity,
        uid,
        date: headers.get("date").cloned(),
        from: headers.get("from").cloned(),
        subject: headers.get("subject").cloned(),
        flags,
    })
}

/// Minimal `Name: value` header parser for the curated field set requested
/// above. Full MIME parsing is explicitly out of scope (`spec.md` §1).
fn parse_header_fields(raw: &[u8]) -> std::collections::HashMap<String, String> {
    let text = String::from_utf8_lossy(raw);
    let mut fields = std::collections::HashMap::new();
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            fields.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }
    fields
}

/// Enter IDLE on `session`, consuming it into a [`ImapIdle`] handle.
pub async fn idle_init(session: ImapSession) -> AppResult<ImapIdle> {
    let mut handle = session.idle();
    handle
        .init()
        .await
        .map_err(|e| AppError::UpstreamUnavailable(format!("IDLE init failed: {e}")))?;
    Ok(handle)
}

/// Outcome of waiting on an IDLE handle until either server push or timeout.
pub enum IdleWake {
    ServerPush,
    TimedOut,
    Cancelled,
}

/// Wait on `handle` for a server push or `idle_timeout`, honouring `cancel`.
pub async fn idle_wait(
    handle: &mut ImapIdle,
    idle_timeout: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> IdleWake {
    let (idle_wait, interrupt) = handle.wait_with_timeout(idle_timeout);
    tokio::select! {
        result = idle_wait => {
            match result {
                Ok(IdleResponse::NewData(_)) => IdleWake::ServerPush,
                Ok(IdleResponse::Timeout) | Ok(IdleResponse::ManualInterrupt) => IdleWake::TimedOut,
                Err(_) => IdleWake::TimedOut,
            }
        }
        _ = cancel.cancelled() => {
            drop(interrupt);
            IdleWake::Cancelled
        }
    }
}

/// End IDLE and return the underlying session.
pub async fn idle_done(handle: ImapIdle, deadline: Duration) -> AppResult<ImapSession> {
    timeout(deadline, handle.done())
        .await
        .map_err(|_| AppError::Timeout("IDLE DONE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::UpstreamUnavailable(format!("IDLE DONE failed: {e}"))))
}

/// Best-effort clean logout. Failure is logged, never propagated
/// (`spec.md` §4.B: "failure to logout is logged, not raised").
pub async fn logout(mut session: ImapSession, deadline: Duration) {
    match timeout(deadline, session.logout()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "IMAP logout failed"),
        Err(_) => tracing::warn!("IMAP logout timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_curated_header_fields() {
        let raw = b"Date: Mon, 1 Jan 2026 00:00:00 +0000\r\nFrom: a@b.test\r\nSubject: Hi\r\n\r\n";
        let fields = parse_header_fields(raw);
        assert_eq!(fields.get("from").map(String::as_str), Some("a@b.test"));
        assert_eq!(fields.get("subject").map(String::as_str), Some("Hi"));
    }
}
