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
//! Keyboard-interactive authentication driven by an [`AuthorizerFacade`] task.
//!
//! russh asks the handler for one challenge at a time while the authorizers
//! expect to call a [`Prompter`] whenever they like. The authorizers therefore
//! run in their own task and hand questions and notices over a channel; the
//! handler turns each of them into an `INFO_REQUEST` and feeds the answers back.
//!
//! [`AuthorizerFacade`]: crate::authorization::AuthorizerFacade

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::Services;
use crate::authorization::{Authorization, Prompter, RequestContext};
use crate::shared::error::{Error, Result};
use crate::shared::net::Remote;

#[derive(Debug)]
enum Event {
    Prompt {
        message: String,
        echo: bool,
        answer: oneshot::Sender<String>,
    },
    Info(String),
    Done(Result<Authorization>),
}

struct ChannelPrompter {
    events: mpsc::Sender<Event>,
}

impl ChannelPrompter {
    async fn emit(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::network("client left keyboard-interactive authentication"))
    }
}

#[async_trait]
impl Prompter for ChannelPrompter {
    async fn prompt(&self, message: &str, echo: bool) -> Result<String> {
        let (answer, received) = oneshot::channel();
        self.emit(Event::Prompt {
            message: message.to_string(),
            echo,
            answer,
        })
        .await?;
        received
            .await
            .map_err(|_| Error::network("client left keyboard-interactive authentication"))
    }

    async fn send_info(&self, message: &str) -> Result<()> {
        self.emit(Event::Info(message.to_string())).await
    }

    async fn send_error(&self, message: &str) -> Result<()> {
        self.emit(Event::Info(format!("Error: {message}"))).await
    }
}

/// Next challenge of the conversation as seen by the handler.
#[derive(Debug)]
pub enum Step {
    Prompt { message: String, echo: bool },
    Info(String),
    Done(Result<Authorization>),
}

/// One running keyboard-interactive conversation.
pub struct Interactive {
    events: mpsc::Receiver<Event>,
    pending: Option<oneshot::Sender<String>>,
    task: JoinHandle<()>,
}

impl Interactive {
    pub fn start(services: Arc<Services>, remote: Remote) -> Self {
        let (tx, events) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let prompter = ChannelPrompter { events: tx.clone() };
            let ctx = RequestContext {
                remote: &remote,
                sessions: &services.sessions,
                validator: &services.environments,
            };
            let result = services
                .authorizers
                .authorize_interactive(&ctx, &prompter)
                .await;
            let _ = tx.send(Event::Done(result)).await;
        });
        Self {
            events,
            pending: None,
            task,
        }
    }

    /// Hand the client's answer to the question asked last.
    ///
    /// Answers without an outstanding question (replies to notices) are dropped.
    pub fn answer(&mut self, answer: String) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.send(answer);
        }
    }

    /// Wait for what has to be sent to the client next.
    ///
    /// `None` if the conversation ended without an outcome.
    pub async fn next(&mut self) -> Option<Step> {
        match self.events.recv().await? {
            Event::Prompt {
                message,
                echo,
                answer,
            } => {
                self.pending = Some(answer);
                Some(Step::Prompt { message, echo })
            }
            Event::Info(message) => Some(Step::Info(message)),
            Event::Done(result) => Some(Step::Done(result)),
        }
    }
}

impl Drop for Interactive {
    fn drop(&mut self) {
        self.task.abort();
    }
}
