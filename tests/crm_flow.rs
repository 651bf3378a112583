use croquet::crm::{self, CrmSettings};
use croquet::settings::{DatabaseSettings, Settings};
use croquet::{CroquetBuilder, Status};
use reqwest::Client;
use tempfile::TempDir;

fn settings(dir: &TempDir) -> Settings<CrmSettings> {
    Settings {
        host: "127.0.0.1".to_string(),
        port: 0,
        db: Some(DatabaseSettings {
            url: Some(format!(
                "sqlite://{}?mode=rwc",
                dir.path().join("crm.db").display()
            )),
            max_active: 4,
            min_idle: 0,
            initial_size: 1,
            create_schema: true,
            ..Default::default()
        }),
        app: CrmSettings {
            current_user: "ada".to_string(),
            mail_server: "smtp.example.com".to_string(),
            mail_user: Some("crm".to_string()),
            mail_pass: None,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_browse_companies_and_their_people() {
    let dir = TempDir::new().unwrap();
    let running = crm::configure_builder(CroquetBuilder::from_settings(settings(&dir)))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let base = format!("http://{}", running.local_addr());
    let client = Client::builder().cookie_store(true).build().unwrap();

    // the redirect after the post lands back on the company listing
    let listing = client
        .post(format!("{}/company", base))
        .form(&[
            ("id", ""),
            ("name", "Initech"),
            ("street", "4120 Freidrich Ln"),
            ("city", "Austin"),
            ("state", "TX"),
            ("zip", "78744"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(listing.status(), 200);
    let html = listing.text().await.unwrap();
    assert!(html.contains("Initech was added"));
    assert!(html.contains("companyid=1"));

    // shown once only
    let again = client
        .get(format!("{}/company", base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(!again.contains("Initech was added"));
    assert!(again.contains(">Initech</a>"));

    let people = client
        .post(format!("{}/people?companyid=1", base))
        .form(&[
            ("name", "Peter"),
            ("email", "peter@initech.test"),
            ("phone", "555-0142"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(people.status(), 200);
    let html = people.text().await.unwrap();
    assert!(html.contains("People at Initech"));
    assert!(html.contains("peter@initech.test"));
    assert!(html.contains("Initech</td>"));

    let edit = client
        .get(format!("{}/?companyid=1&edit=1", base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(edit.contains("value=\"Peter\""));
    assert!(edit.contains(">Update</button>"));

    assert_eq!(running.shutdown().await.unwrap(), Status::Stopped);
}
