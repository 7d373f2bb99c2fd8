//! Host lifecycle, dispatch and scheduling tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use exthost_core::{HostConfig, HostError, HostResult, InstanceId, MessageKind};
use exthost_runtime::{Extension, ExtensionHost, HostContext, Registrar, TaskFlow};

/// Replies to async messages after a delay; no sync callback.
struct Delayed {
    delay: Duration,
    destroyed: Arc<AtomicUsize>,
}

impl Delayed {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            destroyed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Extension for Delayed {
    fn register(&self, registrar: &mut Registrar) -> HostResult<()> {
        registrar.set_extension_name("delayed")?;
        registrar.set_script_api("")
    }

    fn on_instance_created(&self, ctx: &HostContext, instance: InstanceId) -> HostResult<()> {
        let delay = self.delay;
        ctx.set_message_callback(instance, move |ctx, instance, message| {
            let reply = format!("late {message}");
            let _ = ctx.schedule_after(instance, delay, move |ctx| {
                let _ = ctx.post_message(instance, reply.clone());
                TaskFlow::Break
            });
        })
    }

    fn on_instance_destroyed(&self, _ctx: &HostContext, _instance: InstanceId) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_reply_arrives_after_delay() {
    let host = ExtensionHost::load(Delayed::new(Duration::from_secs(2)), HostConfig::default())
        .unwrap();
    let mut instance = host.create_instance().unwrap();

    let start = tokio::time::Instant::now();
    instance.post_message("hi").unwrap();
    assert_eq!(host.pending_tasks(), 1);

    let envelope = instance.recv().await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(envelope.payload, "late hi");
    assert_eq!(envelope.kind, MessageKind::Async);
    assert_eq!(envelope.instance, instance.id());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(instance.try_recv().is_none());
    assert_eq!(host.pending_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_before_delay_drops_reply() {
    let host = ExtensionHost::load(Delayed::new(Duration::from_secs(2)), HostConfig::default())
        .unwrap();
    let instance = host.create_instance().unwrap();
    let id = instance.id();

    instance.post_message("bye").unwrap();
    assert_eq!(host.context().pending_tasks_for(id), 1);

    instance.close().unwrap();
    assert_eq!(host.pending_tasks(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(host.active_instances().is_empty());
}

#[tokio::test]
async fn test_create_then_destroy_without_messages() {
    let extension = Delayed::new(Duration::from_secs(2));
    let destroyed = Arc::clone(&extension.destroyed);
    let host = ExtensionHost::load(extension, HostConfig::default()).unwrap();

    let mut instance = host.create_instance().unwrap();
    assert!(instance.try_recv().is_none());
    let id = instance.id();
    drop(instance);

    assert!(!host.context().is_active(id));
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        host.destroy_instance(id),
        Err(HostError::InstanceGone { .. })
    ));
}

#[tokio::test]
async fn test_instance_ids_are_unique() {
    let host = ExtensionHost::load(Delayed::new(Duration::ZERO), HostConfig::default()).unwrap();
    let a = host.create_instance().unwrap();
    let b = host.create_instance().unwrap();

    assert_ne!(a.id(), b.id());
    assert_eq!(host.active_instances(), vec![a.id(), b.id()]);
}

#[tokio::test]
async fn test_instance_limit() {
    let config = HostConfig::builder().max_instances(2usize).build().unwrap();
    let host = ExtensionHost::load(Delayed::new(Duration::ZERO), config).unwrap();

    let _a = host.create_instance().unwrap();
    let b = host.create_instance().unwrap();
    assert!(matches!(
        host.create_instance(),
        Err(HostError::InstanceLimit { max: 2 })
    ));

    b.close().unwrap();
    assert!(host.create_instance().is_ok());
}

#[tokio::test]
async fn test_instance_limit_under_contention() {
    let config = HostConfig::builder().max_instances(1usize).build().unwrap();
    let host = ExtensionHost::load(Delayed::new(Duration::ZERO), config).unwrap();
    let ctx = host.context();

    for _ in 0..50 {
        let barrier = std::sync::Barrier::new(8);
        let created: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        ctx.create_instance().ok()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(created.iter().flatten().count(), 1);
        drop(created);
        assert!(host.active_instances().is_empty());
    }
}

#[tokio::test]
async fn test_callback_bound_once() {
    let host = ExtensionHost::load(Delayed::new(Duration::ZERO), HostConfig::default()).unwrap();
    let instance = host.create_instance().unwrap();

    let err = host
        .context()
        .set_message_callback(instance.id(), |_, _, _| {})
        .unwrap_err();
    assert!(matches!(
        err,
        HostError::CallbackAlreadySet {
            kind: MessageKind::Async,
            ..
        }
    ));

    host.context()
        .set_sync_message_callback(instance.id(), |_, _, m| Some(m.len().to_string()))
        .unwrap();
    assert_eq!(instance.send_sync_message("four").unwrap(), "4");
}

#[tokio::test]
async fn test_sync_without_callback_is_empty() {
    let host = ExtensionHost::load(Delayed::new(Duration::ZERO), HostConfig::default()).unwrap();
    let instance = host.create_instance().unwrap();

    assert_eq!(instance.send_sync_message("anyone?").unwrap(), "");
}

#[tokio::test]
async fn test_post_to_gone_instance() {
    let host = ExtensionHost::load(Delayed::new(Duration::ZERO), HostConfig::default()).unwrap();
    let instance = host.create_instance().unwrap();
    let id = instance.id();
    instance.close().unwrap();

    let err = host.context().post_message(id, "late").unwrap_err();
    assert!(err.is_gone());
}

#[tokio::test(start_paused = true)]
async fn test_continue_rearms_until_cancelled() {
    let host = ExtensionHost::load(Delayed::new(Duration::ZERO), HostConfig::default()).unwrap();
    let mut instance = host.create_instance().unwrap();
    let id = instance.id();

    let task = host
        .context()
        .schedule_after(id, Duration::from_secs(1), move |ctx| {
            let _ = ctx.post_message(id, "tick");
            TaskFlow::Continue
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let mut ticks = 0;
    while instance.try_recv().is_some() {
        ticks += 1;
    }
    assert_eq!(ticks, 3);

    assert!(host.context().cancel_task(task));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(instance.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_everything() {
    let host = ExtensionHost::load(Delayed::new(Duration::from_secs(2)), HostConfig::default())
        .unwrap();
    let ctx = host.context().clone();
    let mut instance = host.create_instance().unwrap();
    instance.post_message("never").unwrap();

    host.shutdown().await;

    assert!(ctx.is_shut_down());
    assert_eq!(ctx.pending_tasks(), 0);
    assert!(instance.recv().await.is_none());
    assert!(matches!(ctx.create_instance(), Err(HostError::ShutDown)));
}

#[test]
fn test_load_outside_runtime() {
    let err = ExtensionHost::load(Delayed::new(Duration::ZERO), HostConfig::default()).unwrap_err();
    assert!(matches!(err, HostError::NoRuntime));
}

#[tokio::test]
async fn test_disabled_extension() {
    let config = HostConfig::default().disable_extension("delayed");
    let err = ExtensionHost::load(Delayed::new(Duration::ZERO), config).unwrap_err();
    assert!(matches!(err, HostError::ExtensionDisabled { ref name } if name == "delayed"));
}

/// Fails setup so the host must roll the instance back.
struct Refuses;

impl Extension for Refuses {
    fn register(&self, registrar: &mut Registrar) -> HostResult<()> {
        registrar.set_extension_name("refuses")?;
        registrar.set_script_api("")
    }

    fn on_instance_created(&self, _ctx: &HostContext, instance: InstanceId) -> HostResult<()> {
        Err(HostError::InstanceGone { instance })
    }
}

#[tokio::test]
async fn test_failed_setup_rolls_back() {
    let host = ExtensionHost::load(Refuses, HostConfig::default()).unwrap();
    assert!(host.create_instance().is_err());
    assert!(host.active_instances().is_empty());
}
