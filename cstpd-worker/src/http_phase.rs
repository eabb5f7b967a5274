//! The HTTP control phase.
//!
//! Reads requests off the TLS channel one at a time, dispatches known
//! URLs to the supervisor's inline auth handlers and hands CONNECT to
//! the tunnel negotiator. A budget of [`MAX_HTTP_REQUESTS`] bounds how
//! long a client may loiter here.

use bytes::BytesMut;
use tracing::info;

use cstpd_core::http::{Method, Request, RequestParser};
use cstpd_core::session::IOCallbackResult;

use crate::hooks::{AuthContext, HandlerOutcome};
use crate::{MAX_HTTP_REQUESTS, Worker, WorkerError, metrics};

pub(crate) const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";

const READ_CHUNK_SIZE: usize = 2048;

/// How the control phase ended.
#[derive(Debug)]
pub(crate) enum HttpOutcome {
    /// The exchange is over; close and exit cleanly.
    Finished,
    /// CONNECT negotiated a tunnel; run the data loop.
    Tunnel,
}

/// The inline auth handlers dispatched from the known-URL table.
#[derive(Debug, Clone, Copy)]
enum Route {
    AuthForm,
    NewAuth,
    OldAuth,
}

fn get_route(url: &str) -> Option<Route> {
    match url {
        "/" | "/auth" => Some(Route::AuthForm),
        _ => None,
    }
}

fn post_route(url: &str) -> Option<Route> {
    match url {
        "/" => Some(Route::NewAuth),
        "/auth" => Some(Route::OldAuth),
        _ => None,
    }
}

impl Worker {
    pub(crate) async fn http_phase(&mut self) -> Result<HttpOutcome, WorkerError> {
        let mut requests_left = MAX_HTTP_REQUESTS;

        loop {
            if requests_left == 0 {
                info!("maximum number of HTTP requests reached");
                return Err(WorkerError::RequestBudgetExhausted);
            }
            requests_left -= 1;

            let mut parser = RequestParser::new();
            self.read_until(&mut parser, |req| req.headers_complete)
                .await?;

            match parser.request().method {
                Method::Get => {
                    let req = parser.into_request();
                    let Some(route) = get_route(&req.url) else {
                        info!(url = %req.url, "unexpected URL");
                        metrics::http_unknown_url();
                        self.tls.send_all(NOT_FOUND).await?;
                        return Ok(HttpOutcome::Finished);
                    };

                    match self.run_page_handler(route, &req).await? {
                        HandlerOutcome::Reenter if req.http_minor == 1 => continue,
                        _ => return Ok(HttpOutcome::Finished),
                    }
                }
                Method::Post => {
                    // The body belongs to the handler; wait for it all.
                    self.read_until(&mut parser, |req| req.message_complete)
                        .await?;
                    let req = parser.into_request();
                    let Some(route) = post_route(&req.url) else {
                        info!(url = %req.url, "unexpected POST URL");
                        metrics::http_unknown_url();
                        self.tls.send_all(NOT_FOUND).await?;
                        return Ok(HttpOutcome::Finished);
                    };

                    match self.run_page_handler(route, &req).await? {
                        HandlerOutcome::Reenter if req.http_minor == 1 => continue,
                        _ => return Ok(HttpOutcome::Finished),
                    }
                }
                Method::Connect => {
                    let req = parser.into_request();
                    self.connect_handler(&req).await?;
                    return Ok(HttpOutcome::Tunnel);
                }
                Method::Other => {
                    info!("unexpected method");
                    self.tls.send_all(NOT_FOUND).await?;
                    return Ok(HttpOutcome::Finished);
                }
            }
        }
    }

    /// Feeds TLS records to the parser until `done` says so.
    async fn read_until(
        &mut self,
        parser: &mut RequestParser,
        done: impl Fn(&Request) -> bool,
    ) -> Result<(), WorkerError> {
        while !done(parser.request()) {
            if !self.tls.pending() {
                self.tls.readable().await?;
            }

            let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);
            match self.tls.try_recv(&mut chunk) {
                IOCallbackResult::Ok(0) => {
                    info!("error receiving client data");
                    return Err(WorkerError::ControlReceive);
                }
                IOCallbackResult::Ok(_) => parser.feed(&chunk)?,
                IOCallbackResult::WouldBlock => continue,
                IOCallbackResult::Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    async fn run_page_handler(
        &mut self,
        route: Route,
        req: &Request,
    ) -> Result<HandlerOutcome, WorkerError> {
        let pages = self.auth_pages.clone();
        let ctx = AuthContext {
            auth: &mut self.auth,
            tls: self.tls.as_mut(),
            peer_addr: self.peer_addr,
        };

        let outcome = match route {
            Route::AuthForm => pages.get_auth(req, ctx).await,
            Route::NewAuth => pages.post_new_auth(req, ctx).await,
            Route::OldAuth => pages.post_old_auth(req, ctx).await,
        };

        outcome.map_err(WorkerError::Handler)
    }
}
