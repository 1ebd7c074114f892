//! Process-long coordination: mode-driven service composition, the
//! reconnect loop and graceful shutdown.
//!
//! Services start in dependency order — bus, auth, health, tools, HTTP
//! surface, stdio — and stop in reverse. Any recoverable failure tears the
//! whole composition down and re-runs it after a capped exponential backoff;
//! a permanent auth failure or configuration error ends the process.

use crate::auth::AuthService;
use crate::cache::CacheService;
use crate::config::{RuntimeConfig, RuntimeMode};
use crate::error::{AgentError, EXIT_FATAL, EXIT_OK};
use crate::health::HealthService;
use crate::messaging::{BusClient, Envelope, EnvelopeStream, subjects};
use crate::ratelimit::RateLimiter;
use crate::server::{SessionDeps, http::HttpTransportManager, sse, stdio, streamable};
use crate::tools::{RuntimeScope, ToolService};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Backoff floor, doubling per consecutive failure.
const BACKOFF_BASE: Duration = Duration::from_secs(5);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(600);
/// Hard-kill watchdog after a shutdown signal.
const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(10);
/// How long a stopping component may take before it is reported as leaked.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// `min(5s · 2^(n−1), 10min)` for the nth consecutive failure, without
/// jitter.
pub fn base_backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE.saturating_mul(1u32 << exponent);
    delay.min(BACKOFF_CAP)
}

/// The backoff with up to +10% jitter applied.
pub fn backoff_delay(failures: u32) -> Duration {
    apply_jitter(base_backoff_delay(failures), rand::random::<f64>())
}

/// `delay · (1 + r·0.1)` for `r ∈ [0, 1)`.
pub fn apply_jitter(delay: Duration, r: f64) -> Duration {
    delay.mul_f64(1.0 + r.clamp(0.0, 1.0) * 0.1)
}

/// Why one composition run ended.
enum RunOutcome {
    /// Signal-driven or session-driven clean exit.
    Shutdown,
    /// The control plane ordered a re-authentication.
    Reconnect,
}

pub struct Coordinator {
    config: RuntimeConfig,
}

impl Coordinator {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Run until a clean shutdown or an unrecoverable error. Returns the
    /// process exit code.
    pub async fn run(self) -> i32 {
        let signal = CancellationToken::new();
        spawn_signal_listener(signal.clone());

        let mut failures: u32 = 0;
        loop {
            match self.run_once(signal.clone()).await {
                Ok(RunOutcome::Shutdown) => {
                    info!("shutdown complete");
                    return EXIT_OK;
                }
                Ok(RunOutcome::Reconnect) => {
                    failures = 0;
                    let delay = backoff_delay(1);
                    info!(?delay, "re-authentication requested, restarting services");
                    if wait_or_signal(delay, &signal).await {
                        return EXIT_OK;
                    }
                }
                Err(e) if !e.is_recoverable() => {
                    error!(error = %e, "unrecoverable failure");
                    return e.exit_code();
                }
                Err(e) => {
                    failures += 1;
                    let delay = backoff_delay(failures);
                    warn!(error = %e, failures, ?delay, "startup failed, retrying");
                    if wait_or_signal(delay, &signal).await {
                        return EXIT_OK;
                    }
                }
            }
        }
    }

    /// One composition: start everything the mode needs, wait for a reason
    /// to stop, then tear down in reverse order.
    async fn run_once(&self, signal: CancellationToken) -> Result<RunOutcome, AgentError> {
        let config = &self.config;
        let shutdown = signal.child_token();

        // Bus first; everything else speaks through it.
        let bus = BusClient::connect(config).await?;
        let cache = Arc::new(CacheService::new(&bus, &config.ttls).await?);
        let auth = Arc::new(AuthService::new(bus.clone(), config.credential.clone()));
        auth.set_cache(cache.clone());

        // Auth and health only exist in modes that carry a credential.
        let mut health: Option<HealthService> = None;
        let mut reconnect_sub: Option<EnvelopeStream> = None;
        let identity = if config.credential.is_some() {
            let identity = auth.connect().await?;
            let mut service =
                HealthService::new(cache.clone(), identity.clone(), config.heartbeat_interval);
            service.start().await?;
            health = Some(service);
            reconnect_sub = Some(
                bus.subscribe(subjects::runtime_reconnect(&identity.id))
                    .await?,
            );
            Some(identity)
        } else {
            None
        };

        let mut tool_service = None;
        let mut tool_task: Option<JoinHandle<Result<(), AgentError>>> = None;
        if config.mode.runs_tool_service() {
            // Every non-standalone mode authenticated above.
            let identity = identity.clone().ok_or_else(|| {
                AgentError::ConfigInvalid("tool service requires a credential".to_string())
            })?;
            let scope = match config.mode {
                RuntimeMode::McpStdio => RuntimeScope {
                    agent: true,
                    edge: false,
                },
                _ => RuntimeScope {
                    agent: false,
                    edge: true,
                },
            };
            let (service, events_rx) =
                ToolService::new(bus.clone(), identity, scope, config.forward_stderr);
            tool_task = Some(tokio::spawn(
                service.clone().run(events_rx, shutdown.child_token()),
            ));
            tool_service = Some(service);
        }

        let deps = Arc::new(SessionDeps {
            bus: bus.clone(),
            auth: auth.clone(),
            tool_service: tool_service.clone(),
            rate_limiter: Some(Arc::new(RateLimiter::new(cache.clone()))),
        });

        // HTTP surface: routes are registered before listen.
        let mut http_task: Option<JoinHandle<Result<(), AgentError>>> = None;
        let mut sse_ct: Option<CancellationToken> = None;
        if config.mode.runs_http() {
            let mut manager = HttpTransportManager::new(config)?;
            let bind: SocketAddr = SocketAddr::from(([0, 0, 0, 0], config.remote_port.unwrap_or(0)));
            let (sse_router, ct) = sse::router(deps.clone(), bind);
            manager.mount(sse_router);
            sse_ct = Some(ct);
            manager.mount(streamable::router(deps.clone()));
            http_task = Some(tokio::spawn(manager.listen(shutdown.child_token())));
        }

        let mut stdio_task: Option<JoinHandle<Result<(), AgentError>>> = None;
        if config.mode == RuntimeMode::McpStdio {
            let identity = identity.clone().ok_or_else(|| {
                AgentError::ConfigInvalid("stdio transport requires a credential".to_string())
            })?;
            stdio_task = Some(tokio::spawn(stdio::serve(
                deps.clone(),
                identity.as_ref().clone(),
                shutdown.child_token(),
            )));
        }

        info!(mode = %config.mode, "services running");

        let outcome = self
            .wait_for_stop(
                &shutdown,
                &mut reconnect_sub,
                &auth,
                &mut tool_task,
                &mut http_task,
                &mut stdio_task,
            )
            .await;

        // Teardown in reverse dependency order.
        shutdown.cancel();
        if let Some(ct) = sse_ct {
            ct.cancel();
        }
        stop_task("stdio transport", stdio_task).await;
        stop_task("http listener", http_task).await;
        stop_task("tool service", tool_task).await;
        if let Some(mut health) = health {
            health.stop().await;
        }
        if let Some(sub) = reconnect_sub {
            sub.unsubscribe().await;
        }
        bus.flush().await;

        outcome
    }

    /// Block until something ends this composition: a signal, a reconnect
    /// order, a dead core task or stdio session end.
    async fn wait_for_stop(
        &self,
        shutdown: &CancellationToken,
        reconnect_sub: &mut Option<EnvelopeStream>,
        auth: &Arc<AuthService>,
        tool_task: &mut Option<JoinHandle<Result<(), AgentError>>>,
        http_task: &mut Option<JoinHandle<Result<(), AgentError>>>,
        stdio_task: &mut Option<JoinHandle<Result<(), AgentError>>>,
    ) -> Result<RunOutcome, AgentError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Ok(RunOutcome::Shutdown);
                }
                inbound = wait_envelope(reconnect_sub), if reconnect_sub.is_some() => {
                    match inbound {
                        Some(Envelope::RuntimeReconnect(order)) => {
                            info!(runtime = %order.runtime_id, "reconnect ordered by control plane");
                            auth.clear();
                            return Ok(RunOutcome::Reconnect);
                        }
                        Some(_) => continue,
                        None => {
                            return Err(AgentError::BusUnavailable(
                                "reconnect subscription closed".to_string(),
                            ));
                        }
                    }
                }
                result = join_some(tool_task), if tool_task.is_some() => {
                    return Err(flatten_task("tool service", result));
                }
                result = join_some(http_task), if http_task.is_some() => {
                    return Err(flatten_task("http listener", result));
                }
                result = join_some(stdio_task), if stdio_task.is_some() => {
                    // The single stdio session ending is a clean exit.
                    return match result {
                        Ok(Ok(())) => Ok(RunOutcome::Shutdown),
                        other => Err(flatten_task("stdio transport", other)),
                    };
                }
            }
        }
    }
}

async fn wait_envelope(sub: &mut Option<EnvelopeStream>) -> Option<Envelope> {
    match sub {
        Some(sub) => sub.next().await.map(|inbound| inbound.envelope),
        // Unreachable: guarded by `if reconnect_sub.is_some()`.
        None => std::future::pending().await,
    }
}

async fn join_some(
    task: &mut Option<JoinHandle<Result<(), AgentError>>>,
) -> Result<Result<(), AgentError>, tokio::task::JoinError> {
    match task {
        Some(handle) => {
            let result = handle.await;
            *task = None;
            result
        }
        // Unreachable: guarded by the select precondition.
        None => std::future::pending().await,
    }
}

fn flatten_task(
    component: &str,
    result: Result<Result<(), AgentError>, tokio::task::JoinError>,
) -> AgentError {
    match result {
        Ok(Ok(())) => AgentError::BusUnavailable(format!("{component} ended unexpectedly")),
        Ok(Err(e)) => e,
        Err(join) => AgentError::BusUnavailable(format!("{component} panicked: {join}")),
    }
}

/// Await a stopping component; report it as leaked if it outlives the grace
/// period.
async fn stop_task(component: &str, task: Option<JoinHandle<Result<(), AgentError>>>) {
    let Some(handle) = task else { return };
    match tokio::time::timeout(STOP_GRACE, handle).await {
        Ok(_) => {}
        Err(_) => {
            warn!(component, "still holding resources at shutdown");
        }
    }
}

/// Sleep for `delay` unless the signal fires first. Returns `true` when the
/// wait was interrupted by the signal.
async fn wait_or_signal(delay: Duration, signal: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = signal.cancelled() => true,
    }
}

/// SIGINT/SIGTERM → cancel the token; a second wait starts the hard-kill
/// watchdog.
fn spawn_signal_listener(signal: CancellationToken) {
    tokio::spawn(async move {
        let interrupted = async {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut terminate = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(terminate) => terminate,
                    Err(e) => {
                        warn!(error = %e, "cannot install SIGTERM handler");
                        let _ = ctrl_c.await;
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
        };
        interrupted.await;

        info!("shutdown signal received");
        signal.cancel();

        tokio::time::sleep(SHUTDOWN_WATCHDOG).await;
        error!("graceful shutdown watchdog expired, exiting");
        std::process::exit(EXIT_FATAL);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_monotone_capped() {
        let expected = [5u64, 10, 20, 40, 80, 160, 320, 600, 600, 600];
        for (i, want) in expected.iter().enumerate() {
            let got = base_backoff_delay(i as u32 + 1);
            assert_eq!(got, Duration::from_secs(*want), "failure #{}", i + 1);
        }
    }

    #[test]
    fn test_backoff_never_exceeds_cap_for_large_counts() {
        assert_eq!(base_backoff_delay(64), BACKOFF_CAP);
        assert_eq!(base_backoff_delay(u32::MAX), BACKOFF_CAP);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        assert_eq!(apply_jitter(base, 0.0), base);
        assert_eq!(apply_jitter(base, 1.0), Duration::from_secs(11));

        let mid = apply_jitter(base, 0.5);
        assert!(mid >= base && mid <= Duration::from_secs(11));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        for failures in 1..=10u32 {
            let base = base_backoff_delay(failures);
            let jittered = backoff_delay(failures);
            assert!(jittered >= base);
            assert!(jittered <= base.mul_f64(1.1));
        }
    }
}
