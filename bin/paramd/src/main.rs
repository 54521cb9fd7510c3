//! The parameter service daemon.
//!
//! Wires the settings store, the OAuth2 backend and the two FastCGI server
//! loops together, then dispatches requests on one thread per socket. The
//! REST and file API routing layers sit in front of this binary's sockets;
//! this process answers the health probe, enforces authentication and maps
//! everything else to a JSON error document.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wdx_auth::OAuth2Backend;
use wdx_core::{Clock, ServiceError, SettingsStore, StatusCode, SystemClock};
use wdx_fastcgi::{HttpResponse, Request, RequestHandler, Server, SocketOptions};

/// Seconds every request with a broken token is delayed.
const BROKEN_TOKEN_SLOWDOWN: u64 = 5;
/// Poll timeout of the dispatch loops, milliseconds.
const RECEIVE_TIMEOUT_MS: u32 = 1000;

#[derive(Parser)]
#[command(name = "paramd", about = "Parameter and file access service daemon")]
struct Args {
    /// Path of the daemon configuration file.
    #[arg(long, default_value = "/etc/paramd/paramd.conf")]
    config: PathBuf,

    /// REST API FastCGI socket: a filesystem path or the name of a
    /// service-manager provided socket.
    #[arg(long, default_value = "/var/run/paramd/rest.sock")]
    rest_socket: String,

    /// File API FastCGI socket: a filesystem path or the name of a
    /// service-manager provided socket.
    #[arg(long, default_value = "/var/run/paramd/file.sock")]
    file_socket: String,

    /// Leave freshly created socket nodes owned by the invoking user.
    #[arg(long)]
    no_socket_chown: bool,
}

struct Dispatch {
    backend: Arc<OAuth2Backend>,
}

impl Dispatch {
    fn route(&self, request: &mut Request) -> HttpResponse {
        if request.uri().path() == "/health" {
            return HttpResponse::json(200, r#"{"status":"ok"}"#);
        }

        let bearer = request
            .header("Authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_owned);
        let Some(token) = bearer else {
            return unauthorized(request, StatusCode::AuthRequired);
        };

        let (outcome, _remaining) = self.backend.authenticate_token(&token);
        if !outcome.success {
            let status = if outcome.expired {
                StatusCode::AuthExpired
            } else {
                StatusCode::AuthFailed
            };
            return unauthorized(request, status);
        }

        // the REST and file API routers are separate frontends; everything
        // reaching this fallback names a resource this process does not serve
        error_response(404, "not_found")
    }
}

impl RequestHandler for Dispatch {
    fn handle(&self, mut request: Request) {
        let response = self.route(&mut request);
        if request.respond(&response).is_ok() {
            let _ = request.finish();
        }
    }
}

fn unauthorized(request: &mut Request, status: StatusCode) -> HttpResponse {
    let _ = request.add_response_header("WWW-Authenticate", "Bearer");
    error_response(status.http_status(), status.as_str())
}

fn error_response(http_status: u16, code: &str) -> HttpResponse {
    let document = serde_json::json!({ "error": code });
    HttpResponse::json(http_status, document.to_string())
}

fn run(args: &Args) -> Result<(), ServiceError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let settings = SettingsStore::new(&args.config);
    let backend = Arc::new(OAuth2Backend::from_settings(
        &settings,
        Arc::clone(&clock),
        BROKEN_TOKEN_SLOWDOWN,
    )?);

    let options = SocketOptions {
        owner: if args.no_socket_chown {
            None
        } else {
            SocketOptions::default().owner
        },
        ..SocketOptions::default()
    };
    let rest_server = Server::open(&args.rest_socket, &options, Arc::clone(&clock))
        .map_err(|error| ServiceError::internal(error.to_string()))?;
    let file_server = Server::open(&args.file_socket, &options, Arc::clone(&clock))
        .map_err(|error| ServiceError::internal(error.to_string()))?;
    info!(
        rest = args.rest_socket,
        file = args.file_socket,
        "parameter service listening"
    );

    let handler = Arc::new(Dispatch { backend });
    let rest_handler = Arc::clone(&handler);
    let rest_thread = thread::spawn(move || {
        loop {
            rest_server.receive_next(rest_handler.as_ref(), RECEIVE_TIMEOUT_MS);
        }
    });
    let file_handler = Arc::clone(&handler);
    let file_thread = thread::spawn(move || {
        loop {
            file_server.receive_next(file_handler.as_ref(), RECEIVE_TIMEOUT_MS);
        }
    });

    let _ = rest_thread.join();
    let _ = file_thread.join();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "daemon startup failed");
            ExitCode::FAILURE
        }
    }
}
