use croquet::crm::{self, CrmSettings};
use croquet::persistence::lookup_unit;
use croquet::{ConfigError, CroquetBuilder, CroquetError, NoExtension, Status};
use reqwest::Client;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("croquet.yml");
    let yaml = format!(
        "host: 127.0.0.1\n\
         port: 0\n\
         pid_file: {pid}\n\
         current-user: grace\n\
         mail-server: smtp.example.com\n\
         logging:\n  level: warn\n\
         db:\n  jdbc_url: \"sqlite://{db}?mode=rwc\"\n  max_active: 4\n  min_idle: 0\n  initial_size: 1\n  create_schema: true\n\
         {extra}",
        pid = dir.join("croquet.pid").display(),
        db = dir.join("crm.db").display(),
        extra = extra,
    );
    fs::write(&path, yaml).unwrap();
    path
}

#[tokio::test]
async fn test_crm_starts_serves_and_stops() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    let builder = CroquetBuilder::<CrmSettings>::from_path(&config).unwrap();
    assert_eq!(builder.app_settings().current_user, "grace");

    let croquet = crm::configure_builder(builder).build().unwrap();
    let running = croquet.start().await.unwrap();
    assert_eq!(running.status(), Status::Running);

    let pid_path = dir.path().join("croquet.pid");
    let pid = fs::read_to_string(&pid_path).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());

    let base = format!("http://{}", running.local_addr());
    let client = Client::new();

    let health = client
        .get(format!("{}/statuscheck", base))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "SUCCESS");

    let home = client.get(&base).send().await.unwrap();
    assert_eq!(home.status(), 200);
    let html = home.text().await.unwrap();
    assert!(html.contains("<title>People</title>"));
    assert!(html.contains("Logged in as grace"));

    let missing = client
        .get(format!("{}/nowhere", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    assert_eq!(running.shutdown().await.unwrap(), Status::Stopped);
    assert!(!pid_path.exists());
}

#[tokio::test]
async fn test_missing_application_key_fails_to_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("croquet.yml");
    fs::write(&path, "port: 0\ncurrent-user: grace\n").unwrap();

    let result = CroquetBuilder::<CrmSettings>::from_path(&path);
    assert!(matches!(
        result,
        Err(CroquetError::Config(ConfigError::Load { .. }))
    ));
}

#[tokio::test]
async fn test_bare_application_runs_without_database_or_pid_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("croquet.yml");
    fs::write(
        &path,
        "host: 127.0.0.1\nport: 0\nlogging:\n  level: warn\n  console:\n    enabled: true\n",
    )
    .unwrap();

    let croquet = CroquetBuilder::<NoExtension>::from_path(&path)
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(croquet.status(), Status::Stopped);

    let running = croquet.start().await.unwrap();
    assert_eq!(running.status(), Status::Running);
    assert!(running.pid_file().is_none());
    assert!(running.context().persistence().is_none());

    let response = Client::new()
        .get(format!("http://{}/", running.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    assert_eq!(running.shutdown().await.unwrap(), Status::Stopped);
    let left: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(left, vec!["croquet.yml".to_string()]);
}

#[tokio::test]
async fn test_persistence_unit_with_connection_url_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("croquet.yml");
    let pid = dir.path().join("croquet.pid");
    fs::write(
        &path,
        format!(
            "port: 0\npid_file: {}\ndb:\n  persistence-unit: conflicted\n  jdbc_url: \"sqlite::memory:\"\n",
            pid.display()
        ),
    )
    .unwrap();

    let builder = CroquetBuilder::<NoExtension>::from_path(&path).unwrap();
    let result = builder.build();

    assert!(matches!(
        result,
        Err(ConfigError::ConflictingDatabaseSettings)
    ));
    assert!(!pid.exists());
    assert!(lookup_unit("conflicted").is_err());
}
