//! Directory and file fixtures on a real filesystem

use directory_helpers::fixture::{Directory, File, FileContents};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn test_creating_and_removing_a_directory() {
    let temp = TempDir::new().unwrap();
    let parent = Directory::new(temp.path()).unwrap();
    let project = Directory::child(&parent, "project");

    project.create().await.unwrap();
    assert!(parent.list().await.unwrap().contains(&"project".to_string()));

    project.remove().await.unwrap();
    assert!(!parent.list().await.unwrap().contains(&"project".to_string()));
}

#[tokio::test]
async fn test_removing_a_directory_containing_files() {
    let temp = TempDir::new().unwrap();
    let parent = Directory::new(temp.path()).unwrap();
    let project = Directory::child(&parent, "project");
    project.create().await.unwrap();
    project
        .write([("deep/nested/file.txt", FileContents::from("x"))])
        .await
        .unwrap();

    project.remove().await.unwrap();
    assert!(parent.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_creating_and_modifying_a_file() {
    let temp = TempDir::new().unwrap();
    let file = File::new(temp.path().join("notes.txt")).unwrap();

    file.write("contents").await.unwrap();
    assert_eq!(file.read().await.unwrap(), "contents");

    file.write("new contents").await.unwrap();
    assert_eq!(file.read().await.unwrap(), "new contents");
    assert_eq!(file.stats().await.unwrap().len(), "new contents".len() as u64);

    file.remove().await.unwrap();
    assert!(!file.exists().await.unwrap());
}

#[tokio::test]
async fn test_writing_json_round_trips_through_serde() {
    let temp = TempDir::new().unwrap();
    let project = Directory::new(temp.path().join("project")).unwrap();
    project.create().await.unwrap();

    project
        .write([(
            "package.json",
            FileContents::Json(json!({"name": "project", "version": "0.0.1"})),
        )])
        .await
        .unwrap();

    let text = project.file("package.json").read().await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value, json!({"name": "project", "version": "0.0.1"}));
    assert!(text.ends_with("}\n"));

    let manifest = project.read_manifest().await.unwrap();
    assert_eq!(manifest.version.as_deref(), Some("0.0.1"));
}

#[tokio::test]
async fn test_existence_checks() {
    let temp = TempDir::new().unwrap();
    let dir = Directory::new(temp.path()).unwrap();
    assert!(dir.exists().await.unwrap());
    assert!(dir.stats().await.unwrap().is_dir());

    assert!(!Directory::child(&dir, "does not exist").exists().await.unwrap());
    assert!(!dir.file("does not exist").exists().await.unwrap());
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_and_spawn_run_in_directory() {
    use directory_helpers::subprocess::ChunkSource;

    let temp = TempDir::new().unwrap();
    let dir = Directory::new(temp.path()).unwrap();
    dir.write([("hello.txt", FileContents::from("hi there"))])
        .await
        .unwrap();

    let output = dir.exec("cat", ["hello.txt"]).await.unwrap();
    assert!(output.status.success());
    assert_eq!(output.stdout, "hi there\n");

    let spawned = dir.spawn("cat", ["hello.txt"]).unwrap();
    let chunk = spawned.stream.next().await.unwrap();
    assert_eq!(chunk.text(), "hi there\n");
    assert!(spawned.stream.next().await.unwrap_err().is_stream_closed());
}
