// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Periodic removal of expired sessions and orphaned environments.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Services;
use crate::authorization::RestoreOpts;
use crate::config::FlowName;
use crate::environment::{CleanupOpts, FindOpts};
use crate::session::{self, Session, SessionId, State};
use crate::shared::error::{Error, ErrorKind, Result};

pub struct HouseKeeper {
    services: Arc<Services>,
}

impl HouseKeeper {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Schedule the periodic runs.
    ///
    /// Without `initialDelay` the first run happens right away and its failure
    /// is returned; later failures are only logged.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let conf = &self.services.configuration.housekeeping;
        let every = conf.every.get();
        let initial_delay = conf.initial_delay.get();

        let first_in = if initial_delay.is_zero() {
            self.run()
                .await
                .map_err(|e| e.context("initial housekeeping run failed"))?;
            every
        } else {
            initial_delay
        };

        Ok(tokio::spawn(async move {
            let mut next_in = first_in;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(next_in) => {}
                    _ = cancel.cancelled() => break,
                }
                match AssertUnwindSafe(self.run()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::error!(error = %err, "Housekeeping run failed"),
                    Err(_) => tracing::error!("Housekeeping run panicked"),
                }
                next_in = every;
            }
            tracing::debug!("Housekeeper stopped");
        }))
    }

    /// One pass over every session followed by the environment cleanup.
    pub async fn run(&self) -> Result<()> {
        let started = Instant::now();
        let conf = &self.services.configuration.housekeeping;
        tracing::debug!("Housekeeping run started");

        let mut sessions = Vec::new();
        self.services
            .sessions
            .find_all(
                session::FindOpts {
                    auto_clean_up: conf.auto_repair,
                },
                |session| {
                    sessions.push(session);
                    async { Ok(true) }
                },
            )
            .await
            .map_err(|e| e.context("cannot list sessions"))?;

        let mut remaining: HashSet<(FlowName, SessionId)> = HashSet::new();
        for session in &sessions {
            match self.inspect(session).await {
                Ok(true) => {}
                Ok(false) => {
                    remaining.insert((session.flow().clone(), session.id()));
                }
                Err(err) => {
                    tracing::warn!(session = %session, error = %err, "Cannot clean up session");
                    remaining.insert((session.flow().clone(), session.id()));
                }
            }
        }

        let configuration = &self.services.configuration;
        let flow_exists = |flow: &FlowName| configuration.flow(flow).is_some();
        let session_exists =
            |flow: &FlowName, id: &SessionId| remaining.contains(&(flow.clone(), *id));
        self.services
            .environments
            .cleanup(&CleanupOpts {
                flow_exists: &flow_exists,
                session_exists: &session_exists,
            })
            .await?;

        tracing::info!(
            sessions = sessions.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            next_run_in = ?conf.every.get(),
            "Housekeeping run done"
        );
        Ok(())
    }

    /// Dispose an expired session; delete it once it stayed expired for
    /// `keepExpiredFor`. Returns `true` if it was deleted.
    async fn inspect(&self, session: &Session) -> Result<bool> {
        let info = match session.info().await {
            Ok(info) => info,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err),
        };
        let now = Utc::now();
        let keep = self.services.configuration.housekeeping.keep_expired_for.get();

        if info.is_expired_with_threshold_at(now, keep) {
            self.dispose(session).await?;
            self.services.sessions.delete(session).await?;
            tracing::info!(session = %session, "Expired session deleted");
            return Ok(true);
        }

        if info.is_expired_at(now) && info.state != State::Disposed {
            self.dispose(session).await?;
            tracing::info!(session = %session, "Expired session disposed");
        }
        Ok(false)
    }

    async fn dispose(&self, session: &Session) -> Result<()> {
        match self
            .services
            .environments
            .find_by_session(session, FindOpts { auto_clean_up_allowed: true })
            .await
        {
            Ok(environment) => {
                environment
                    .dispose()
                    .await
                    .map_err(|e| e.context("cannot dispose environment"))?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(Error::wrap(ErrorKind::System, "cannot find environment", err)),
        }

        match self
            .services
            .authorizers
            .restore_from_session(session, RestoreOpts { auto_clean_up_allowed: true })
            .await
        {
            Ok(Some(authorization)) => {
                if let Err(err) = authorization.dispose().await {
                    tracing::warn!(
                        session = %session,
                        error = %err,
                        "Cannot dispose authorization"
                    );
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(session = %session, error = %err, "Cannot restore authorization")
            }
        }

        session.dispose().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::authorization::{testing, Authorization, AuthorizerFacade};
    use crate::config::{
        AuthorizationSpec, Configuration, Duration, EnvironmentSpec, FileMode, Flow, SessionConfig,
    };
    use crate::environment::{
        BoxedStream, Environment, EnvironmentFacade, PtyConfig, Repository, Task,
    };
    use crate::session::FsRepository;

    /// Hands out one environment per session until it was disposed.
    #[derive(Default)]
    struct RecordingRepository {
        disposed: Arc<Mutex<HashSet<SessionId>>>,
        dispose_calls: Arc<AtomicUsize>,
    }

    struct RecordingEnvironment {
        session: Session,
        disposed: Arc<Mutex<HashSet<SessionId>>>,
        dispose_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Environment for RecordingEnvironment {
        fn session(&self) -> &Session {
            &self.session
        }

        async fn banner(&self, _: &Authorization) -> Result<String> {
            Ok(String::new())
        }

        async fn run(&self, _: Task) -> Result<i32> {
            Ok(0)
        }

        fn is_port_forwarding_allowed(&self) -> bool {
            false
        }

        async fn new_destination_connection(&self, _: &str, _: u16) -> Result<BoxedStream> {
            Err(Error::permission("port forwarding not allowed"))
        }

        async fn dispose(&self) -> Result<bool> {
            self.dispose_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.disposed.lock().insert(self.session.id()))
        }
    }

    #[async_trait]
    impl Repository for RecordingRepository {
        async fn will_be_accepted(&self, _: &Authorization) -> Result<bool> {
            Ok(true)
        }

        fn does_support_pty(&self, _: &PtyConfig) -> bool {
            false
        }

        async fn ensure(&self, authorization: &Authorization) -> Result<Arc<dyn Environment>> {
            let session = authorization
                .session()
                .ok_or_else(|| Error::system("authorization without session"))?;
            self.find_by_session(session, FindOpts::default()).await
        }

        async fn find_by_session(
            &self,
            session: &Session,
            _: FindOpts,
        ) -> Result<Arc<dyn Environment>> {
            if self.disposed.lock().contains(&session.id()) {
                return Err(Error::not_found(format!("no environment for session {session}")));
            }
            Ok(Arc::new(RecordingEnvironment {
                session: session.clone(),
                disposed: self.disposed.clone(),
                dispose_calls: self.dispose_calls.clone(),
            }))
        }
    }

    async fn services(keep_expired_for: Duration) -> (tempfile::TempDir, Arc<Services>) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut configuration = Configuration::default();
        configuration.session = SessionConfig {
            storage: dir.path().join("sessions"),
            file_mode: FileMode(0o600),
            max_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        configuration.housekeeping.keep_expired_for = keep_expired_for;
        configuration.flows = vec![Flow {
            name: testing::flow("demo"),
            requirement: Default::default(),
            authorization: AuthorizationSpec::None(Default::default()),
            environment: EnvironmentSpec::Dummy(Default::default()),
        }];
        let services = Services::build(configuration).await.unwrap();
        (dir, Arc::new(services))
    }

    #[tokio::test]
    async fn test_expired_session_is_deleted() {
        let (_dir, services) = services(Duration::ZERO).await;
        let session = services
            .sessions
            .create(&testing::flow("gone"), &testing::remote("alice"), None)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        HouseKeeper::new(services.clone()).run().await.unwrap();

        let err = services
            .sessions
            .find_by_id(session.flow(), &session.id())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_expired_session_is_kept_but_disposed() {
        let (_dir, services) = services(Duration::from_secs(3600)).await;
        let session = services
            .sessions
            .create(&testing::flow("gone"), &testing::remote("alice"), None)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        HouseKeeper::new(services.clone()).run().await.unwrap();

        let info = session.info().await.unwrap();
        assert_eq!(info.state, State::Disposed);
    }

    #[tokio::test]
    async fn test_expired_session_is_disposed_once_then_deleted() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut configuration = Configuration::default();
        configuration.session = SessionConfig {
            storage: dir.path().join("sessions"),
            file_mode: FileMode(0o600),
            max_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        configuration.housekeeping.keep_expired_for = Duration::from_secs(1);

        let repository = Arc::new(RecordingRepository::default());
        let dispose_calls = repository.dispose_calls.clone();
        let mut environments = EnvironmentFacade::new();
        environments.push(testing::flow("demo"), repository);
        let services = Arc::new(Services {
            sessions: FsRepository::new(&configuration.session).await.unwrap(),
            configuration: Arc::new(configuration),
            authorizers: AuthorizerFacade::new(),
            environments,
        });
        let session = services
            .sessions
            .create(&testing::flow("demo"), &testing::remote("alice"), None)
            .await
            .unwrap();
        let housekeeper = HouseKeeper::new(services.clone());

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        housekeeper.run().await.unwrap();
        assert_eq!(dispose_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.info().await.unwrap().state, State::Disposed);

        // Still within keepExpiredFor.
        housekeeper.run().await.unwrap();
        assert_eq!(dispose_calls.load(Ordering::SeqCst), 1);
        assert!(services.sessions.find_by_id(session.flow(), &session.id()).await.is_ok());

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        housekeeper.run().await.unwrap();
        assert_eq!(dispose_calls.load(Ordering::SeqCst), 1);
        let err = services
            .sessions
            .find_by_id(session.flow(), &session.id())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_valid_session_is_untouched() {
        let (_dir, services) = services(Duration::ZERO).await;
        let session = services
            .sessions
            .create(&testing::flow("gone"), &testing::remote("alice"), None)
            .await
            .unwrap();

        HouseKeeper::new(services.clone()).run().await.unwrap();

        assert_eq!(session.info().await.unwrap().state, State::New);
    }
}
