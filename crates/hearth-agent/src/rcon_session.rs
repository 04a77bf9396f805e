//! One authenticated remote-console connection.
//!
//! A session serializes callers through an internal mutex: the framing
//! has no way to disambiguate interleaved multi-packet responses on
//! one socket, so exactly one request may be in flight at a time. Any
//! I/O error or timeout marks the session dead; the next caller must
//! reconnect instead of reusing a corrupted stream.

use std::time::Duration;

use hearth_process::{RconEndpoint, RconError};
use tokio::{net::TcpStream, sync::Mutex};

use crate::rcon_codec::{AUTH_FAILED_ID, Frame, read_frame, write_frame};

#[derive(Debug)]
struct SessionInner {
    stream: Option<TcpStream>,
    authenticated: bool,
    next_request_id: i32,
}

impl SessionInner {
    fn take_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    fn poison(&mut self) {
        self.stream = None;
        self.authenticated = false;
    }
}

#[derive(Debug)]
pub struct RconSession {
    endpoint: RconEndpoint,
    inner: Mutex<SessionInner>,
}

impl RconSession {
    /// Opens the TCP connection. Does not authenticate.
    pub async fn connect(endpoint: RconEndpoint, timeout: Duration) -> Result<Self, RconError> {
        let addr = (endpoint.host.clone(), endpoint.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RconError::Connection(format!(
                    "connect to {}:{} timed out",
                    endpoint.host, endpoint.port
                ))
            })?
            .map_err(|e| {
                RconError::Connection(format!(
                    "connect to {}:{} failed: {e}",
                    endpoint.host, endpoint.port
                ))
            })?;

        Ok(Self {
            endpoint,
            inner: Mutex::new(SessionInner {
                stream: Some(stream),
                authenticated: false,
                next_request_id: 1,
            }),
        })
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.lock().await.authenticated
    }

    /// Sends the login packet and consumes the handshake response.
    /// Idempotent: re-authenticating an authenticated session is a
    /// no-op returning success.
    pub async fn authenticate(&self, timeout: Duration) -> Result<(), RconError> {
        let mut inner = self.inner.lock().await;
        if inner.authenticated {
            return Ok(());
        }

        let password = self.endpoint.password.clone();
        let result = tokio::time::timeout(timeout, Self::handshake(&mut inner, &password)).await;

        match result {
            Ok(Ok(())) => {
                inner.authenticated = true;
                Ok(())
            }
            Ok(Err(err)) => {
                inner.poison();
                Err(err)
            }
            Err(_) => {
                inner.poison();
                Err(RconError::Timeout(timeout))
            }
        }
    }

    async fn handshake(inner: &mut SessionInner, password: &str) -> Result<(), RconError> {
        let auth_id = inner.take_id();
        let stream = inner
            .stream
            .as_mut()
            .ok_or_else(|| RconError::Connection("session is closed".to_string()))?;

        write_frame(stream, &Frame::auth(auth_id, password)).await?;
        let reply = read_frame(stream).await?;

        if reply.request_id == AUTH_FAILED_ID {
            return Err(RconError::Auth);
        }
        if reply.request_id != auth_id {
            return Err(RconError::Protocol(format!(
                "auth response echoed id {} (sent {auth_id})",
                reply.request_id
            )));
        }
        Ok(())
    }

    /// Executes one command and returns the reassembled response text.
    ///
    /// The command frame is followed by an empty probe frame; response
    /// frames are collected, in receipt order, until the probe's empty
    /// echo arrives. The protocol has no other end-of-response marker.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<String, RconError> {
        let mut inner = self.inner.lock().await;
        if !inner.authenticated {
            return Err(RconError::Auth);
        }

        let result = tokio::time::timeout(timeout, Self::exchange(&mut inner, command)).await;

        match result {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(err)) => {
                inner.poison();
                Err(err)
            }
            Err(_) => {
                inner.poison();
                Err(RconError::Timeout(timeout))
            }
        }
    }

    async fn exchange(inner: &mut SessionInner, command: &str) -> Result<String, RconError> {
        let command_id = inner.take_id();
        let probe_id = inner.take_id();
        let stream = inner
            .stream
            .as_mut()
            .ok_or_else(|| RconError::Connection("session is closed".to_string()))?;

        write_frame(stream, &Frame::command(command_id, command)).await?;
        write_frame(stream, &Frame::command(probe_id, "")).await?;

        let mut parts = Vec::new();
        loop {
            let frame = read_frame(stream).await?;
            if frame.request_id == probe_id {
                break;
            }
            parts.push(frame.payload);
        }
        Ok(parts.concat())
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.poison();
    }
}
