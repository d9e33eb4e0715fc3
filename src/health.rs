/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use async_trait::async_trait;
use std::{fmt, future::pending, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Up,
    Down,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Up => write!(f, "UP"),
            HealthState::Down => write!(f, "DOWN"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Shutdown request could not be sent")]
    Transport(#[source] reqwest::Error),

    #[error("Shutdown request was rejected with status {0}")]
    Rejected(u16),
}

#[derive(Debug, Error, PartialEq)]
pub enum PollError {
    #[error("Service did not report {target} within {deadline:?}")]
    DeadlineExceeded {
        target: HealthState,
        deadline: Duration,
    },

    #[error("Service process exited while waiting for it to report {target}")]
    ServiceExited { target: HealthState },

    #[error("Cancelled while waiting for the service to report {target}")]
    Cancelled { target: HealthState },
}

/// The administrative surface of the service under test.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Current health of the service. Any failure to reach the service is `Down`.
    async fn health(&self) -> HealthState;

    /// Asks the service to shut itself down gracefully.
    async fn shutdown(&self) -> Result<(), ShutdownError>;
}

/// Talks to actuator style health and shutdown endpoints over HTTP.
#[derive(Debug, Clone)]
pub struct HttpServiceClient {
    client: reqwest::Client,
    health_url: String,
    shutdown_url: String,
}

impl HttpServiceClient {
    pub fn new(
        health_url: &str,
        shutdown_url: &str,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            health_url: health_url.to_string(),
            shutdown_url: shutdown_url.to_string(),
        })
    }
}

#[async_trait]
impl ServiceClient for HttpServiceClient {
    async fn health(&self) -> HealthState {
        match self.client.get(&self.health_url).send().await {
            Ok(resp) if resp.status().is_success() => HealthState::Up,
            Ok(resp) => {
                trace!("{} responded with {}", self.health_url, resp.status());
                HealthState::Down
            }
            // nothing listening yet, or anymore
            Err(err) => {
                trace!("{} unreachable: {}", self.health_url, err);
                HealthState::Down
            }
        }
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        let resp = self
            .client
            .post(&self.shutdown_url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(ShutdownError::Transport)?;

        if !resp.status().is_success() {
            return Err(ShutdownError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Polls a [`ServiceClient`] until the service reports a given state.
#[derive(Clone)]
pub struct HealthPoller {
    client: Arc<dyn ServiceClient>,
    interval: Duration,
    deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl HealthPoller {
    pub fn new(client: Arc<dyn ServiceClient>, interval: Duration) -> Self {
        Self {
            client,
            interval,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Gives up with [`PollError::DeadlineExceeded`] after `deadline`. `None` polls forever.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Waits one interval before every probe and returns the number of probes made once
    /// the service reports `target`.
    ///
    /// When `exit_signal` is given and fires first, the process being waited on has died
    /// and the wait fails with [`PollError::ServiceExited`].
    pub async fn poll_until(
        &self,
        target: HealthState,
        exit_signal: Option<&CancellationToken>,
    ) -> Result<usize, PollError> {
        let start = Instant::now();

        let polling = async {
            let mut probes = 0;
            loop {
                tokio::time::sleep(self.interval).await;
                probes += 1;

                let observed = self.client.health().await;
                trace!("health probe {} observed {}", probes, observed);
                if observed == target {
                    return probes;
                }
            }
        };

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => pending::<()>().await,
            }
        };

        let exited = async {
            match exit_signal {
                Some(signal) => signal.cancelled().await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            probes = polling => {
                debug!("service reported {} after {} probes in {:?}", target, probes, start.elapsed());
                Ok(probes)
            }
            _ = self.cancel.cancelled() => Err(PollError::Cancelled { target }),
            _ = exited => Err(PollError::ServiceExited { target }),
            _ = deadline => Err(PollError::DeadlineExceeded {
                target,
                // only reachable when a deadline is set
                deadline: self.deadline.unwrap_or_default(),
            }),
        }
    }
}
