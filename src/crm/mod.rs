//! A small CRM: companies, the people working at them and a stand-in mail service.

pub mod data;
pub mod pages;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

use crate::builder::CroquetBuilder;
use crate::inject::{AppContext, Bindings, Module};
use crate::lifecycle::ManagedModule;

pub use data::{Company, DataProvider, Person};
pub use pages::{CompanyPage, PeoplePage, COMPANYID_PARAM, COMPANY_PAGE, PEOPLE_PAGE};

/// Rows per table page.
pub const PAGE_SIZE: u64 = 20;

/// CRM keys of the YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrmSettings {
    #[serde(rename = "current-user")]
    pub current_user: String,
    #[serde(rename = "mail-server")]
    pub mail_server: String,
    #[serde(rename = "mail-user", default)]
    pub mail_user: Option<String>,
    #[serde(rename = "mail-pass", default)]
    pub mail_pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(String);

impl CurrentUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Binds the CRM's singletons.
pub struct CrmModule {
    settings: CrmSettings,
}

impl CrmModule {
    pub fn new(settings: CrmSettings) -> Self {
        Self { settings }
    }
}

impl Module for CrmModule {
    fn configure(&self, bindings: &mut Bindings) {
        bindings.bind(CurrentUser::new(self.settings.current_user.clone()));
    }
}

/// Pretends to connect to the mail server for as long as the application runs.
pub struct EmailModule {
    settings: CrmSettings,
}

impl EmailModule {
    pub fn new(ctx: &AppContext) -> anyhow::Result<Self> {
        let settings = ctx.require::<CrmSettings>()?;
        Ok(Self {
            settings: (*settings).clone(),
        })
    }
}

#[async_trait]
impl ManagedModule for EmailModule {
    fn name(&self) -> &str {
        "email"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        info!(
            "Starting emailer with {} {}",
            self.settings.mail_server,
            self.settings.mail_user.as_deref().unwrap_or("(anonymous)")
        );
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        info!("Stopping emailer");
        Ok(())
    }
}

/// Pages, mounts and entities of the CRM, shared by the binary and its tests.
pub fn configure_builder(builder: CroquetBuilder<CrmSettings>) -> CroquetBuilder<CrmSettings> {
    let settings = builder.app_settings().clone();
    builder
        .home_page(PEOPLE_PAGE, PeoplePage)
        .add_page(COMPANY_PAGE, CompanyPage)
        .add_page_mount("/people", PEOPLE_PAGE)
        .add_page_mount("/company", COMPANY_PAGE)
        .add_health_check("/statuscheck")
        .add_entity::<Company>()
        .add_entity::<Person>()
        .add_module(CrmModule::new(settings))
        .add_managed_module(EmailModule::new)
}
