//! The upgrade handshake as a state machine.
//!
//! One [`ClientEngine`] serves one connection attempt. The caller alternates
//! [`ClientEngine::create_upgrade_request`] and [`ClientEngine::process_response`], sending each
//! request and reading each response over the transport, until the engine reports success or
//! fails.

use crate::{
    auth::{challenge_scheme, Authenticator},
    config::ClientConfig,
    extension::{negotiate, offer, parse_header, NegotiatedExtensions},
    handshake::{
        accept_key, generate_key, Headers, UpgradeRequest, UpgradeResponse, AUTHORIZATION,
        CONNECTION, LOCATION, RETRY_AFTER, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS,
        SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, SWITCHING_PROTOCOLS,
        UPGRADE, WEBSOCKET_VERSION, WWW_AUTHENTICATE,
    },
    AuthError, Error, HandshakeError, RedirectError,
};
use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tracing::{debug, info, trace};
use url::Url;

#[derive(Clone)]
pub enum HandshakeState {
    Init,
    UpgradeRequestCreated,
    /// The last request carried credentials.
    AuthUpgradeRequestCreated,
    RedirectRequired,
    AuthRequired {
        authenticator: Arc<dyn Authenticator>,
        challenge: String,
    },
    Success,
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Success | HandshakeState::Failed)
    }

    fn name(&self) -> &'static str {
        match self {
            HandshakeState::Init => "Init",
            HandshakeState::UpgradeRequestCreated => "UpgradeRequestCreated",
            HandshakeState::AuthUpgradeRequestCreated => "AuthUpgradeRequestCreated",
            HandshakeState::RedirectRequired => "RedirectRequired",
            HandshakeState::AuthRequired { .. } => "AuthRequired",
            HandshakeState::Success => "Success",
            HandshakeState::Failed => "Failed",
        }
    }
}

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::AuthRequired {
                authenticator,
                challenge,
            } => f
                .debug_struct("AuthRequired")
                .field("authenticator", authenticator)
                .field("challenge", challenge)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

impl PartialEq for HandshakeState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                HandshakeState::AuthRequired { challenge: a, .. },
                HandshakeState::AuthRequired { challenge: b, .. },
            ) => a == b,
            (a, b) => a.name() == b.name(),
        }
    }
}

/// The result of a successful upgrade.
#[derive(Debug)]
pub struct Upgraded {
    pub subprotocol: Option<String>,
    pub extensions: NegotiatedExtensions,
    pub response: UpgradeResponse,
}

#[derive(Debug)]
pub enum UpgradeOutcome {
    Success(Upgraded),
    /// Call [`ClientEngine::create_upgrade_request`] and send the result.
    AnotherRequestRequired,
}

pub struct ClientEngine {
    config: Arc<ClientConfig>,
    target: Url,
    state: HandshakeState,
    request: Option<UpgradeRequest>,
    redirect_location: Option<Url>,
    redirect_history: HashSet<Url>,
    redirects: usize,
}

impl fmt::Debug for ClientEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEngine")
            .field("target", &self.target.as_str())
            .field("state", &self.state)
            .field("redirect_location", &self.redirect_location)
            .field("redirects", &self.redirects)
            .finish()
    }
}

impl ClientEngine {
    pub fn new(target: Url, config: Arc<ClientConfig>) -> Result<Self, Error> {
        check_target(&target)?;

        debug!(
            url = %target,
            redirect_enabled = config.redirect_enabled,
            redirect_threshold = config.redirect_threshold,
            "created handshake engine"
        );

        Ok(ClientEngine {
            config,
            redirect_history: HashSet::from([target.clone()]),
            target,
            state: HandshakeState::Init,
            request: None,
            redirect_location: None,
            redirects: 0,
        })
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// The URL the current request goes to.
    pub fn current_url(&self) -> &Url {
        self.redirect_location.as_ref().unwrap_or(&self.target)
    }

    /// Builds the next request to send.
    pub fn create_upgrade_request(&mut self) -> Result<UpgradeRequest, Error> {
        let request = match std::mem::replace(&mut self.state, HandshakeState::Failed) {
            HandshakeState::Init => {
                let mut request = self.initial_request()?;
                if let Some(before_request) = &self.config.before_request {
                    before_request(&mut request.headers);
                }
                self.state = HandshakeState::UpgradeRequestCreated;
                request
            }

            HandshakeState::RedirectRequired => {
                let (Some(mut request), Some(location)) =
                    (self.request.take(), self.redirect_location.clone())
                else {
                    return Err(self.illegal_state("redirect without a previous request"));
                };
                request.url = location;
                request.update_host_and_origin()?;
                self.state = HandshakeState::UpgradeRequestCreated;
                request
            }

            HandshakeState::AuthRequired {
                authenticator,
                challenge,
            } => {
                let Some(mut request) = self.request.take() else {
                    return Err(self.illegal_state("authentication without a previous request"));
                };
                debug!(?authenticator, "computing authorization");
                let authorization = match authenticator.generate_authorization_header(
                    &request.url,
                    &challenge,
                    self.config.credentials.as_ref(),
                ) {
                    Ok(authorization) => authorization,
                    Err(err) => {
                        self.redirect_history.clear();
                        return Err(err);
                    }
                };
                request.headers.insert(AUTHORIZATION, authorization);
                self.state = HandshakeState::AuthUpgradeRequestCreated;
                request
            }

            state => {
                self.state = state;
                return Err(self.illegal_state("no request can be created in this state"));
            }
        };

        self.log_upgrade_message("sending handshake request", &request.to_string());
        self.request = Some(request.clone());
        Ok(request)
    }

    fn initial_request(&mut self) -> Result<UpgradeRequest, Error> {
        let mut request = UpgradeRequest {
            url: self.target.clone(),
            headers: Headers::new(),
        };
        request.update_host_and_origin()?;

        let headers = &mut request.headers;
        headers.append(UPGRADE, "websocket");
        headers.append(CONNECTION, "Upgrade");
        headers.append(SEC_WEBSOCKET_KEY, generate_key()?);
        headers.append(SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION);

        if !self.config.preferred_subprotocols.is_empty() {
            headers.append(
                SEC_WEBSOCKET_PROTOCOL,
                self.config.preferred_subprotocols.join(", "),
            );
        }
        if !self.config.extensions.is_empty() {
            let offers = self
                .config
                .extensions
                .iter()
                .map(|extension| offer(extension.as_ref()).to_string())
                .collect::<Vec<_>>();
            headers.append(SEC_WEBSOCKET_EXTENSIONS, offers.join(", "));
        }

        Ok(request)
    }

    /// Consumes the server's answer to the last request.
    ///
    /// A 503 answer returns [`Error::RetryAfter`] and leaves the state alone. Every other error
    /// moves the engine to [`HandshakeState::Failed`].
    pub fn process_response(
        &mut self,
        response: &UpgradeResponse,
    ) -> Result<UpgradeOutcome, Error> {
        self.log_upgrade_message("received handshake response", &response.to_string());

        match self.state {
            HandshakeState::UpgradeRequestCreated | HandshakeState::AuthUpgradeRequestCreated => {}
            _ => {
                self.redirect_history.clear();
                return Err(self.illegal_state("no request is awaiting a response"));
            }
        }

        match response.status {
            SWITCHING_PROTOCOLS => self.handle_switch_protocols(response),
            300 | 301 | 302 | 303 | 307 | 308 => self.handle_redirect(response),
            401 => self.handle_auth(response),
            503 => {
                let delay = response
                    .headers
                    .get(RETRY_AFTER)
                    .and_then(|value| parse_retry_after(value, SystemTime::now()));
                debug!(?delay, "service unavailable");
                Err(Error::RetryAfter { delay })
            }
            status => self.fail(HandshakeError::UnexpectedStatus(status).into()),
        }
    }

    /// Reports a transport failure during the handshake. Returns the error to surface.
    pub fn process_error(&mut self, error: Error) -> Error {
        match self.state {
            HandshakeState::Success => {
                debug!(%error, "transport error after a successful handshake");
                self.illegal_state("the handshake already succeeded")
            }
            HandshakeState::Failed => {
                debug!(%error, "transport error after the handshake failed");
                self.illegal_state("the handshake already failed")
            }
            _ => {
                self.state = HandshakeState::Failed;
                self.redirect_history.clear();
                error
            }
        }
    }

    fn handle_switch_protocols(
        &mut self,
        response: &UpgradeResponse,
    ) -> Result<UpgradeOutcome, Error> {
        self.redirect_history.clear();
        let subprotocol = match self.validate(response) {
            Ok(subprotocol) => subprotocol,
            Err(err) => return self.fail(err),
        };

        let offered = parse_header(response.headers.get_all(SEC_WEBSOCKET_EXTENSIONS));
        let installed = &self.config.extensions;
        let extensions = match negotiate(&offered, installed, self.config.incoming_buffer_size) {
            Ok(extensions) => extensions,
            Err(err) => return self.fail(err),
        };

        self.state = HandshakeState::Success;
        if let Some(after_response) = &self.config.after_response {
            after_response(response);
        }
        debug!(?subprotocol, ?extensions, "upgrade complete");

        Ok(UpgradeOutcome::Success(Upgraded {
            subprotocol,
            extensions,
            response: response.clone(),
        }))
    }

    fn validate(&self, response: &UpgradeResponse) -> Result<Option<String>, Error> {
        let headers = &response.headers;
        if !headers.has_token(UPGRADE, "websocket") {
            return Err(HandshakeError::MissingOrInvalidHeader(UPGRADE.into()).into());
        }
        if !headers.has_token(CONNECTION, "upgrade") {
            return Err(HandshakeError::MissingOrInvalidHeader(CONNECTION.into()).into());
        }

        let key = self
            .request
            .as_ref()
            .and_then(|request| request.headers.get(SEC_WEBSOCKET_KEY))
            .ok_or(Error::IllegalState("no key was sent"))?;
        if headers.get(SEC_WEBSOCKET_ACCEPT) != Some(accept_key(key).as_str()) {
            return Err(HandshakeError::MissingOrInvalidHeader(SEC_WEBSOCKET_ACCEPT.into()).into());
        }

        match headers.get(SEC_WEBSOCKET_PROTOCOL).map(str::trim) {
            None | Some("") => Ok(None),
            Some(protocol) if self.config.preferred_subprotocols.iter().any(|p| p == protocol) => {
                Ok(Some(protocol.into()))
            }
            Some(protocol) => Err(HandshakeError::UnexpectedSubprotocol(protocol.into()).into()),
        }
    }

    fn handle_redirect(&mut self, response: &UpgradeResponse) -> Result<UpgradeOutcome, Error> {
        let status = response.status;
        if !self.config.redirect_enabled {
            return self.fail(RedirectError::NotEnabled { status }.into());
        }

        let location = match response.headers.get(LOCATION).map(str::trim) {
            Some(location) if !location.is_empty() => location,
            _ => return self.fail(RedirectError::MissingLocation { status }.into()),
        };

        let Some(resolved) = self.resolve_location(location) else {
            return self.fail(
                RedirectError::InvalidLocation {
                    status,
                    location: location.into(),
                }
                .into(),
            );
        };
        trace!(base = %self.current_url(), location, %resolved, "resolved redirect");

        if !self.redirect_history.insert(resolved.clone()) {
            return self.fail(RedirectError::InfiniteLoop { status }.into());
        }
        self.redirects += 1;
        if self.redirects > self.config.redirect_threshold {
            return self.fail(
                RedirectError::ThresholdExceeded {
                    status,
                    threshold: self.config.redirect_threshold,
                }
                .into(),
            );
        }

        debug!(%resolved, redirects = self.redirects, "following redirect");
        self.redirect_location = Some(resolved);
        self.state = HandshakeState::RedirectRequired;
        Ok(UpgradeOutcome::AnotherRequestRequired)
    }

    fn resolve_location(&self, location: &str) -> Option<Url> {
        let mut resolved = self.current_url().join(location).ok()?;
        let scheme = match resolved.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => return None,
        };
        resolved.set_scheme(scheme).ok()?;
        resolved.set_fragment(None);
        resolved.host_str()?;
        Some(resolved)
    }

    fn handle_auth(&mut self, response: &UpgradeResponse) -> Result<UpgradeOutcome, Error> {
        if self.state == HandshakeState::AuthUpgradeRequestCreated {
            return self.fail(AuthError::AlreadyAttempted.into());
        }

        let challenge = match response.headers.get(WWW_AUTHENTICATE).map(str::trim) {
            Some(challenge) if !challenge.is_empty() => challenge,
            _ => return self.fail(AuthError::MissingChallenge.into()),
        };
        let Some(scheme) = challenge_scheme(challenge) else {
            return self.fail(AuthError::MissingChallenge.into());
        };
        let Some(authenticator) = self.config.auth_config.get(scheme) else {
            return self.fail(AuthError::UnsupportedScheme(scheme.into()).into());
        };

        debug!(scheme, "authentication required");
        self.state = HandshakeState::AuthRequired {
            authenticator,
            challenge: challenge.into(),
        };
        Ok(UpgradeOutcome::AnotherRequestRequired)
    }

    fn fail(&mut self, error: Error) -> Result<UpgradeOutcome, Error> {
        debug!(%error, "handshake failed");
        self.state = HandshakeState::Failed;
        self.redirect_history.clear();
        Err(error)
    }

    fn illegal_state(&self, message: &'static str) -> Error {
        debug!(state = ?self.state, message, "handshake engine misuse");
        Error::IllegalState(message)
    }

    fn log_upgrade_message(&self, what: &str, message: &str) {
        if self.config.log_upgrade_messages {
            info!(url = %self.current_url(), "{}:\n{}", what, message.trim_end());
        } else {
            debug!(url = %self.current_url(), "{}:\n{}", what, message.trim_end());
        }
    }
}

/// Accepts `ws` and `wss` URLs with a host.
pub fn check_target(url: &Url) -> Result<(), Error> {
    match url.scheme() {
        "ws" | "wss" => {}
        scheme => return Err(Error::IncorrectScheme(scheme.into())),
    }
    if url.host_str().is_none() {
        return Err(Error::NoHost);
    }
    Ok(())
}

/// Parses a `Retry-After` value into seconds from `now`.
///
/// HTTP-dates are tried first and may yield a negative delay for dates in the past. Anything
/// that is neither a date nor an integer gives `None`.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<i64> {
    let value = value.trim();
    if let Ok(date) = httpdate::parse_http_date(value) {
        let millis = match date.duration_since(now) {
            Ok(ahead) => millis(ahead),
            Err(behind) => -millis(behind.duration()),
        };
        return Some(millis / 1000);
    }
    value.parse().ok()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
