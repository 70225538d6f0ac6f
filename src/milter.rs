use crate::session::{Response, Session, SessionFactory};
use indymilter::{Callbacks, Config as IndyConfig, SetErrorReply, SocketInfo, Status};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};

pub struct Milter {
    factory: Arc<SessionFactory>,
}

impl Milter {
    pub fn new(factory: Arc<SessionFactory>) -> Self {
        Milter { factory }
    }

    pub async fn run(&self, socket_path: &str) -> anyhow::Result<()> {
        log::info!("Starting milter on: {}", socket_path);
        // Remove existing socket if it exists
        if std::path::Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        let factory = self.factory.clone();

        // Each connection's Session lives in the context's data slot.
        let callbacks: Callbacks<Session> = Callbacks::new()
            .on_connect(move |ctx, hostname, socket_info| {
                let hostname = hostname.to_string_lossy().to_string();
                let ip = match socket_info {
                    SocketInfo::Inet(addr) => addr.ip().to_string(),
                    _ => String::new(),
                };
                // The MTA passes its reverse lookup of the client as the hostname.
                let (session, response) = factory.connect(&hostname, &ip, &hostname);
                ctx.data = Some(session);
                let status = to_status(response);
                Box::pin(async move { status })
            })
            .on_helo(|ctx, name| {
                let name = name.to_string_lossy().to_string();
                let status = with_session(&mut ctx.data, |s| s.helo(&name));
                Box::pin(async move { status })
            })
            .on_mail(|ctx, args| {
                let sender = first_arg(&args);
                let status = with_session(&mut ctx.data, |s| s.mail(&sender));
                Box::pin(async move { status })
            })
            .on_rcpt(|ctx, args| {
                let recipient = first_arg(&args);
                let status = with_session(&mut ctx.data, |s| s.rcpt(&recipient));
                Box::pin(async move { status })
            })
            .on_header(|ctx, name, value| {
                let name = name.to_string_lossy().to_string();
                let value = value.to_string_lossy().to_string();
                let status = with_session(&mut ctx.data, |s| s.header(&name, &value));
                Box::pin(async move { status })
            })
            .on_eom(|ctx| {
                let status = match ctx.data.as_mut().map(Session::eom) {
                    Some(Response::Reject { reply }) => {
                        let (code, xcode, text) = split_reply(&reply);
                        if let Err(e) = ctx.reply.set_error_reply(code, xcode, vec![text]) {
                            log::error!("Failed to set reply '{reply}': {e}");
                        }
                        Status::Reject
                    }
                    Some(response) => to_status(response),
                    None => {
                        log::warn!("End of message without a session, accepting");
                        Status::Accept
                    }
                };
                Box::pin(async move { status })
            })
            .on_abort(|ctx| {
                if let Some(session) = ctx.data.as_mut() {
                    session.abort();
                }
                Box::pin(async { Status::Continue })
            })
            .on_close(|ctx| {
                if let Some(session) = ctx.data.take() {
                    log::debug!("[{}] connection closed", session.id());
                }
                Box::pin(async { Status::Continue })
            });

        let config = IndyConfig::default();

        indymilter::run(listener, callbacks, config, shutdown_signal()).await?;
        log::info!("Milter stopped");
        Ok(())
    }
}

fn with_session<F>(data: &mut Option<Session>, handle: F) -> Status
where
    F: FnOnce(&mut Session) -> Response,
{
    match data.as_mut() {
        Some(session) => to_status(handle(session)),
        None => {
            log::warn!("Event received before connect, ignoring");
            Status::Continue
        }
    }
}

fn to_status(response: Response) -> Status {
    match response {
        Response::Continue => Status::Continue,
        Response::Accept => Status::Accept,
        Response::Reject { .. } => Status::Reject,
    }
}

/// The address is the first argument; ESMTP parameters follow it.
fn first_arg(args: &[std::ffi::CString]) -> String {
    args.first()
        .map(|a| a.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Split `"550 5.7.1 text"` into reply code, optional enhanced code and text.
fn split_reply(reply: &str) -> (&str, Option<&str>, &str) {
    let (code, rest) = reply.split_once(' ').unwrap_or((reply, ""));
    match rest.split_once(' ') {
        Some((xcode, text)) if is_enhanced_code(xcode) => (code, Some(xcode), text),
        _ if is_enhanced_code(rest) => (code, Some(rest), ""),
        _ => (code, None, rest),
    }
}

fn is_enhanced_code(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

async fn shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM ({e}), stopping on Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    log::info!("Received shutdown signal");
}
