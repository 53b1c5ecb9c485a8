//! Plugin pipeline (§4.7): an ordered transform chain applied to outgoing
//! and incoming messages. The sender runs `before_send` over every message
//! it sends; the receiver runs `after_receive` over every delivered message
//! before the pump hands it to user code.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Message, ReceivedMessage};

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn before_send(&self, message: Message) -> Result<Message> {
        Ok(message)
    }

    async fn after_receive(&self, message: ReceivedMessage) -> Result<ReceivedMessage> {
        Ok(message)
    }

    /// By default a plugin exception propagates and aborts the operation
    /// (§4.7 "by default"). Returning `true` opts out: the exception is
    /// reported and the original message continues down the pipeline.
    fn should_continue_on_exception(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct PluginPipeline {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub async fn run_before_send(&self, mut message: Message) -> Result<Message> {
        for plugin in &self.plugins {
            match plugin.before_send(message.clone()).await {
                Ok(transformed) => message = transformed,
                Err(e) => {
                    if plugin.should_continue_on_exception() {
                        tracing::warn!(plugin = plugin.name(), error = %e, "before_send plugin failed, continuing");
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Ok(message)
    }

    pub async fn run_after_receive(&self, mut message: ReceivedMessage) -> Result<ReceivedMessage> {
        for plugin in &self.plugins {
            match plugin.after_receive(message.clone()).await {
                Ok(transformed) => message = transformed,
                Err(e) => {
                    if plugin.should_continue_on_exception() {
                        tracing::warn!(plugin = plugin.name(), error = %e, "after_receive plugin failed, continuing");
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Ok(message)
    }
}
