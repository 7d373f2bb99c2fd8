//! Scripted extensions driven through the script bridge.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use exthost_core::{HostConfig, HostError, parse_timestamp};
use exthost_runtime::{ExtensionHost, ExtensionManager, ExtensionManifest, ScriptBridge, ScriptedExtension};

const MAIN: &str = r#"
    fn reply(instance, message) {
        post_message(instance, "echo " + instance + " " + message);
        false
    }

    fn on_message(instance, message) {
        timeout_add_seconds(2, instance, Fn("reply"), message);
    }

    fn on_sync_message(instance, message) {
        "sync " + instance + " " + message
    }
"#;

const API: &str = r#"
    fn ping(msg, callback) {
        extension_set_message_listener(callback);
        extension_post_message(msg);
    }

    fn ping_sync(msg) {
        extension_send_sync_message(msg)
    }
"#;

fn write_echo(root: &Path, dir: &str, name: &str) -> PathBuf {
    let path = root.join(dir);
    fs::create_dir_all(&path).unwrap();
    fs::write(
        path.join(ExtensionManifest::FILE_NAME),
        format!("name = \"{name}\"\napi = \"api.rhai\"\n"),
    )
    .unwrap();
    fs::write(path.join("main.rhai"), MAIN).unwrap();
    fs::write(path.join("api.rhai"), API).unwrap();
    path
}

fn load_echo(root: &Path) -> ExtensionHost {
    let dir = write_echo(root, "echo", "echo");
    let extension = ScriptedExtension::load(&dir, &Default::default()).unwrap();
    ExtensionHost::load(extension, HostConfig::default()).unwrap()
}

#[tokio::test]
async fn test_sync_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let host = load_echo(root.path());
    let mut bridge = ScriptBridge::attach(&host).unwrap();
    let id = bridge.instance().id();

    let reply = bridge.eval(r#"ping_sync("hello")"#).unwrap();
    assert_eq!(reply.into_string().unwrap(), format!("sync {id} hello"));
}

#[tokio::test(start_paused = true)]
async fn test_async_reply_through_timeout() {
    let root = tempfile::tempdir().unwrap();
    let host = load_echo(root.path());
    let mut bridge = ScriptBridge::attach(&host).unwrap();
    let id = bridge.instance().id();

    let start = tokio::time::Instant::now();
    let _ = bridge.eval(r#"ping("there", |reply| reply.len())"#).unwrap();
    assert_eq!(host.pending_tasks(), 1);

    let delivery = bridge.next_reply().await.unwrap().unwrap();
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(delivery.envelope.payload, format!("echo {id} there"));
    assert!(delivery.result.is_some());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(bridge.drain().unwrap().is_empty());
    assert_eq!(host.pending_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closure_bindings() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("bound");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(ExtensionManifest::FILE_NAME), "name = \"bound\"\n").unwrap();
    fs::write(
        dir.join("main.rhai"),
        r#"
            set_script_api("fn ask(msg) { extension_send_sync_message(msg) }");

            fn on_instance_created(instance) {
                set_sync_message_callback(instance, |instance, message| message.to_upper());
            }
        "#,
    )
    .unwrap();

    let extension = ScriptedExtension::load(&dir, &Default::default()).unwrap();
    assert!(extension.has_hook("on_instance_created"));
    let host = ExtensionHost::load(extension, HostConfig::default()).unwrap();
    let mut bridge = ScriptBridge::attach(&host).unwrap();

    let reply = bridge.eval(r#"ask("quiet")"#).unwrap();
    assert_eq!(reply.into_string().unwrap(), "QUIET");
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_script_timeout() {
    let root = tempfile::tempdir().unwrap();
    let host = load_echo(root.path());
    let mut bridge = ScriptBridge::attach(&host).unwrap();

    let _ = bridge.eval(r#"ping("lost", |reply| reply)"#).unwrap();
    assert_eq!(host.pending_tasks(), 1);

    bridge.close().unwrap();
    assert_eq!(host.pending_tasks(), 0);
    tokio::time::sleep(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_manager_discovers_extensions() {
    let root = tempfile::tempdir().unwrap();
    write_echo(root.path(), "one", "first");
    write_echo(root.path(), "two", "second");
    write_echo(root.path(), "three", "third");

    let config = HostConfig::default()
        .with_extension_dir(root.path())
        .disable_extension("second");
    let mut manager = ExtensionManager::new(config).unwrap();

    let names = manager.discover().unwrap();
    assert_eq!(names, vec!["first", "third"]);
    assert!(manager.get("second").is_none());

    let err = manager
        .load(ScriptedExtension::load(&root.path().join("one"), &Default::default()).unwrap())
        .unwrap_err();
    assert!(matches!(err, HostError::DuplicateExtension { .. }));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_bundled_echo_extension() {
    let dir = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../../extensions/echo"));
    let extension = ScriptedExtension::load(dir, &Default::default()).unwrap();
    assert_eq!(extension.name(), "example");

    let host = ExtensionHost::load(extension, HostConfig::default()).unwrap();
    let mut bridge = ScriptBridge::attach(&host).unwrap();
    let prefix = format!("Hello from rhai: {} ", bridge.instance().id());

    let reply = bridge.eval(r#"getTimeSync("now?")"#).unwrap().into_string().unwrap();
    let stamp = reply
        .strip_prefix(&prefix)
        .and_then(|rest| rest.strip_prefix("now? "))
        .unwrap();
    assert!(parse_timestamp(stamp).is_some(), "bad timestamp in {reply}");

    let start = tokio::time::Instant::now();
    let _ = bridge.eval(r#"startTimeTick("tick", |reply| reply)"#).unwrap();
    let delivery = bridge.next_reply().await.unwrap().unwrap();
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(delivery.envelope.payload.starts_with(&format!("{prefix}tick ")));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(bridge.drain().unwrap().is_empty());
    assert_eq!(host.pending_tasks(), 0);
}
