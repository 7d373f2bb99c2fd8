//! Extension host: lifecycle, dispatch and replies.
//!
//! [`ExtensionHost`] owns one loaded extension. [`HostContext`] is the cheap,
//! cloneable handle handed to extension callbacks; it exposes the host
//! primitives (binding callbacks, posting replies, scheduling deferred tasks).
//! [`Instance`] is the script-facing end of one attached context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use exthost_core::{Envelope, HostConfig, HostError, HostResult, InstanceId, MessageKind};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::extension::{Extension, MessageCallback, Registrar, SyncMessageCallback};
use crate::scheduler::{Scheduler, TaskFlow, TaskId};

/// Per-instance state. Present while the instance is active.
struct InstanceSlot {
    outbound: mpsc::UnboundedSender<Envelope>,
    on_message: Option<MessageCallback>,
    on_sync_message: Option<SyncMessageCallback>,
    cancel: CancellationToken,
}

struct HostShared {
    name: String,
    script_api: String,
    extension: Arc<dyn Extension>,
    config: HostConfig,
    instances: DashMap<InstanceId, InstanceSlot>,
    /// Slots reserved against `max_instances`, including ones still in setup.
    active: AtomicUsize,
    next_instance: AtomicU32,
    scheduler: Scheduler,
    closed: AtomicBool,
}

/// Handle to a running host, passed to extension callbacks.
#[derive(Clone)]
pub struct HostContext {
    shared: Arc<HostShared>,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("extension", &self.shared.name)
            .field("instances", &self.shared.instances.len())
            .finish()
    }
}

impl HostContext {
    /// Name the extension registered with.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Script API the extension registered with.
    pub fn script_api(&self) -> &str {
        &self.shared.script_api
    }

    /// Host configuration.
    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    /// Whether the instance is currently active.
    pub fn is_active(&self, instance: InstanceId) -> bool {
        self.shared.instances.contains_key(&instance)
    }

    /// Ids of all active instances, in ascending order.
    pub fn active_instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.shared.instances.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Whether [`ExtensionHost::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> HostResult<()> {
        if self.is_shut_down() {
            return Err(HostError::ShutDown);
        }
        Ok(())
    }

    fn gone(instance: InstanceId) -> HostError {
        HostError::InstanceGone { instance }
    }

    /// Attach a new script context.
    pub fn create_instance(&self) -> HostResult<Instance> {
        self.ensure_open()?;

        let max = self.shared.config.max_instances;
        self.shared
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| HostError::InstanceLimit { max })?;

        let id = InstanceId::new(self.shared.next_instance.fetch_add(1, Ordering::Relaxed));
        let (outbound, inbox) = mpsc::unbounded_channel();
        self.shared.instances.insert(
            id,
            InstanceSlot {
                outbound,
                on_message: None,
                on_sync_message: None,
                cancel: self.shared.scheduler.instance_token(),
            },
        );

        if let Err(err) = self.shared.extension.on_instance_created(self, id) {
            self.release(id);
            tracing::warn!(extension = %self.name(), instance = %id, error = %err, "instance setup failed");
            return Err(err);
        }

        tracing::debug!(extension = %self.name(), instance = %id, "instance created");
        Ok(Instance {
            id,
            ctx: self.clone(),
            inbox,
            closed: false,
        })
    }

    /// Remove the slot and cancel the instance's tasks.
    fn release(&self, instance: InstanceId) -> bool {
        match self.shared.instances.remove(&instance) {
            Some((_, slot)) => {
                self.shared.active.fetch_sub(1, Ordering::AcqRel);
                slot.cancel.cancel();
                self.shared.scheduler.forget_instance(instance);
                true
            }
            None => false,
        }
    }

    /// Detach a script context. Its pending deferred tasks never run.
    pub fn destroy_instance(&self, instance: InstanceId) -> HostResult<()> {
        if !self.release(instance) {
            return Err(Self::gone(instance));
        }
        self.shared.extension.on_instance_destroyed(self, instance);
        tracing::debug!(extension = %self.name(), %instance, "instance destroyed");
        Ok(())
    }

    /// Bind the async message callback of an instance. May be called once.
    pub fn set_message_callback<F>(&self, instance: InstanceId, callback: F) -> HostResult<()>
    where
        F: Fn(&HostContext, InstanceId, &str) + Send + Sync + 'static,
    {
        let mut slot = self
            .shared
            .instances
            .get_mut(&instance)
            .ok_or_else(|| Self::gone(instance))?;
        if slot.on_message.is_some() {
            return Err(HostError::CallbackAlreadySet {
                instance,
                kind: MessageKind::Async,
            });
        }
        slot.on_message = Some(Arc::new(callback));
        Ok(())
    }

    /// Bind the sync message callback of an instance. May be called once.
    pub fn set_sync_message_callback<F>(&self, instance: InstanceId, callback: F) -> HostResult<()>
    where
        F: Fn(&HostContext, InstanceId, &str) -> Option<String> + Send + Sync + 'static,
    {
        let mut slot = self
            .shared
            .instances
            .get_mut(&instance)
            .ok_or_else(|| Self::gone(instance))?;
        if slot.on_sync_message.is_some() {
            return Err(HostError::CallbackAlreadySet {
                instance,
                kind: MessageKind::Sync,
            });
        }
        slot.on_sync_message = Some(Arc::new(callback));
        Ok(())
    }

    /// Push an async reply to an instance.
    pub fn post_message(&self, instance: InstanceId, message: impl Into<String>) -> HostResult<()> {
        self.ensure_open()?;
        let slot = self
            .shared
            .instances
            .get(&instance)
            .ok_or_else(|| Self::gone(instance))?;
        slot.outbound
            .send(Envelope::post(instance, message))
            .map_err(|_| Self::gone(instance))
    }

    /// Deliver an async message from a script context to the extension.
    ///
    /// Messages to an instance without a bound callback are dropped.
    pub fn dispatch_message(&self, instance: InstanceId, message: &str) -> HostResult<()> {
        self.ensure_open()?;
        // Clone the callback out so it can call back into the host.
        let callback = self
            .shared
            .instances
            .get(&instance)
            .ok_or_else(|| Self::gone(instance))?
            .on_message
            .clone();

        match callback {
            Some(callback) => callback(self, instance, message),
            None => tracing::debug!(%instance, "no message callback bound, dropping message"),
        }
        Ok(())
    }

    /// Deliver a sync message and return the reply.
    ///
    /// Without a bound callback, or when the callback has no answer, the
    /// reply is the empty string.
    pub fn dispatch_sync_message(&self, instance: InstanceId, message: &str) -> HostResult<String> {
        self.ensure_open()?;
        let callback = self
            .shared
            .instances
            .get(&instance)
            .ok_or_else(|| Self::gone(instance))?
            .on_sync_message
            .clone();

        let reply = match callback {
            Some(callback) => callback(self, instance, message),
            None => {
                tracing::debug!(%instance, "no sync message callback bound");
                None
            }
        };
        Ok(reply.unwrap_or_default())
    }

    /// Run `task` after `delay` on behalf of an instance.
    ///
    /// The task is owned by the host until it finishes. It is cancelled when
    /// the instance is destroyed and never runs for an inactive instance.
    /// Returning [`TaskFlow::Continue`] re-arms it with the same delay.
    pub fn schedule_after<F>(
        &self,
        instance: InstanceId,
        delay: Duration,
        mut task: F,
    ) -> HostResult<TaskId>
    where
        F: FnMut(&HostContext) -> TaskFlow + Send + 'static,
    {
        self.ensure_open()?;
        let cancel = self
            .shared
            .instances
            .get(&instance)
            .ok_or_else(|| Self::gone(instance))?
            .cancel
            .child_token();

        let ctx = self.clone();
        Ok(self
            .shared
            .scheduler
            .schedule(instance, delay, cancel, move || {
                if !ctx.is_active(instance) {
                    return TaskFlow::Break;
                }
                task(&ctx)
            }))
    }

    /// Cancel a scheduled task. Returns `false` if it already finished.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.shared.scheduler.cancel(id)
    }

    /// Number of deferred tasks that have not finished.
    pub fn pending_tasks(&self) -> usize {
        self.shared.scheduler.pending()
    }

    /// Number of unfinished deferred tasks owned by one instance.
    pub fn pending_tasks_for(&self, instance: InstanceId) -> usize {
        self.shared.scheduler.pending_for(instance)
    }
}

/// Owner of one loaded extension.
pub struct ExtensionHost {
    ctx: HostContext,
}

impl std::fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost").field("ctx", &self.ctx).finish()
    }
}

impl ExtensionHost {
    /// Load an extension. Must be called from within a tokio runtime.
    pub fn load<E: Extension>(extension: E, config: HostConfig) -> HostResult<Self> {
        Self::load_shared(Arc::new(extension), config)
    }

    /// Load an already shared extension.
    pub fn load_shared(extension: Arc<dyn Extension>, config: HostConfig) -> HostResult<Self> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| HostError::NoRuntime)?;

        let mut registrar = Registrar::new();
        extension.register(&mut registrar)?;
        let registration = registrar.finish()?;

        if config.is_disabled(&registration.name) {
            return Err(HostError::ExtensionDisabled {
                name: registration.name,
            });
        }

        tracing::info!(extension = %registration.name, "extension loaded");

        Ok(Self {
            ctx: HostContext {
                shared: Arc::new(HostShared {
                    name: registration.name,
                    script_api: registration.script_api,
                    extension,
                    config,
                    instances: DashMap::new(),
                    active: AtomicUsize::new(0),
                    next_instance: AtomicU32::new(1),
                    scheduler: Scheduler::new(handle),
                    closed: AtomicBool::new(false),
                }),
            },
        })
    }

    /// Handle for callbacks and script bridges.
    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    /// Name the extension registered with.
    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    /// Script API the extension registered with.
    pub fn script_api(&self) -> &str {
        self.ctx.script_api()
    }

    /// Attach a new script context.
    pub fn create_instance(&self) -> HostResult<Instance> {
        self.ctx.create_instance()
    }

    /// Detach a script context.
    pub fn destroy_instance(&self, instance: InstanceId) -> HostResult<()> {
        self.ctx.destroy_instance(instance)
    }

    /// Ids of all active instances.
    pub fn active_instances(&self) -> Vec<InstanceId> {
        self.ctx.active_instances()
    }

    /// Number of deferred tasks that have not finished.
    pub fn pending_tasks(&self) -> usize {
        self.ctx.pending_tasks()
    }

    /// Destroy all instances, wait for deferred tasks to stop and notify the
    /// extension.
    pub async fn shutdown(self) {
        let shared = &self.ctx.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for instance in self.ctx.active_instances() {
            // Another thread may have destroyed it already.
            let _ = self.ctx.destroy_instance(instance);
        }
        shared.scheduler.shutdown().await;
        shared.extension.on_shutdown();

        tracing::info!(extension = %shared.name, "extension shut down");
    }
}

impl Drop for ExtensionHost {
    fn drop(&mut self) {
        self.ctx.shared.closed.store(true, Ordering::Release);
        self.ctx.shared.scheduler.cancel_all();
    }
}

/// Script-facing end of one attached context.
///
/// Dropping the handle destroys the instance if it is still active.
pub struct Instance {
    id: InstanceId,
    ctx: HostContext,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    closed: bool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").field("id", &self.id).finish()
    }
}

impl Instance {
    /// Id of this instance.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Host this instance is attached to.
    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    /// Whether the host still considers this instance active.
    pub fn is_active(&self) -> bool {
        self.ctx.is_active(self.id)
    }

    /// Send an async message to the extension.
    pub fn post_message(&self, message: &str) -> HostResult<()> {
        self.ctx.dispatch_message(self.id, message)
    }

    /// Send a sync message and wait for the reply.
    pub fn send_sync_message(&self, message: &str) -> HostResult<String> {
        self.ctx.dispatch_sync_message(self.id, message)
    }

    /// Wait for the next reply posted to this instance.
    ///
    /// Returns `None` once the instance is destroyed and all queued replies
    /// have been taken.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    /// Take a queued reply without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbox.try_recv().ok()
    }

    /// Destroy the instance.
    pub fn close(mut self) -> HostResult<()> {
        self.closed = true;
        self.ctx.destroy_instance(self.id)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.ctx.destroy_instance(self.id) {
            if !err.is_gone() {
                tracing::warn!(instance = %self.id, error = %err, "failed to destroy instance");
            }
        }
    }
}
