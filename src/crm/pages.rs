use async_trait::async_trait;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;

use crate::crm::data::{Company, DataProvider, Person};
use crate::crm::{CurrentUser, PAGE_SIZE};
use crate::error::PersistError;
use crate::persistence::{Entity, Filter, UnitOfWork};
use crate::ui::html::escape;
use crate::ui::{Page, PageContext, PageError, PageResponse};

pub const PEOPLE_PAGE: &str = "people";
pub const COMPANY_PAGE: &str = "company";
pub const COMPANYID_PARAM: &str = "companyid";

/// Inserts a new entity or updates an existing one in its own transaction.
/// Returns whether it was added.
async fn save<T: Entity>(uow: &UnitOfWork, entity: &mut T) -> Result<bool, PersistError> {
    let mut session = uow.get().await?;
    session.begin_transaction().await?;
    let result = match entity.id() {
        None => session.persist(entity).await.map(|_| true),
        Some(_) => session.merge(entity).await.map(|_| false),
    };
    session.finish(result).await
}

/// Saves and queues the outcome for the next page the visitor sees.
async fn save_and_report<T: Entity + std::fmt::Display>(
    ctx: &PageContext,
    entity: &mut T,
) -> Result<(), PageError> {
    match save(ctx.unit_of_work()?, entity).await {
        Ok(true) => {
            debug!("{} created", entity);
            ctx.flash(format!("{} was added", entity)).await
        }
        Ok(false) => {
            debug!("{} updated", entity);
            ctx.flash(format!("{} was updated", entity)).await
        }
        Err(e) => {
            error!("Error communicating with database: {}", e);
            ctx.flash(format!("Error communicating with database: {}", e))
                .await
        }
    }
}

fn parse_id(value: &str, name: &str) -> Result<i64, PageError> {
    value
        .trim()
        .parse()
        .map_err(|_| PageError::BadRequest(format!("'{}' is not a valid {}", value, name)))
}

fn form_id(ctx: &PageContext) -> Result<i64, PageError> {
    match ctx.form_value("id").map(str::trim) {
        None | Some("") => Ok(0),
        Some(id) => parse_id(id, "id"),
    }
}

/// Applies `page` and `sort` query parameters to a listing.
fn apply_listing<T: Entity>(
    ctx: &PageContext,
    page: &mut u64,
    provider: &mut DataProvider<T>,
) -> Result<(), PageError> {
    if let Some(value) = ctx.query_param("page") {
        *page = value
            .parse()
            .map_err(|_| PageError::BadRequest(format!("'{}' is not a page number", value)))?;
    }
    match ctx.query_param("sort") {
        Some("asc") => provider.set_ascending(true),
        Some("desc") => provider.set_ascending(false),
        Some(other) => return Err(PageError::BadRequest(format!("Unknown sort '{}'", other))),
        None => {}
    }
    Ok(())
}

fn link(base: &str, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        return base.to_string();
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
        .finish();
    format!("{}?{}", base, query)
}

fn text_input(html: &mut String, name: &str, label: &str, value: &str, enabled: bool) {
    let _ = writeln!(
        html,
        "<label>{} <input type=\"text\" name=\"{}\" value=\"{}\"{}></label>",
        label,
        name,
        escape(value),
        if enabled { "" } else { " disabled" }
    );
}

/// Moves `page` back onto the last page holding rows and returns its first row.
fn clamp_page(page: &mut u64, total: u64) -> u64 {
    let last = total.div_ceil(PAGE_SIZE).saturating_sub(1);
    *page = (*page).min(last);
    *page * PAGE_SIZE
}

fn pager(html: &mut String, base: &[(&str, String)], path: &str, page: u64, total: u64) {
    let pages = total.div_ceil(PAGE_SIZE).max(1);
    html.push_str("<div class=\"pager\">");
    if page > 0 {
        let mut params = base.to_vec();
        params.push(("page", (page - 1).to_string()));
        let _ = write!(html, "<a href=\"{}\">&lt; Previous</a> ", escape(&link(path, &params)));
    }
    let _ = write!(html, "Page {} of {} ({} rows)", page + 1, pages, total);
    if page + 1 < pages {
        let mut params = base.to_vec();
        params.push(("page", (page + 1).to_string()));
        let _ = write!(html, " <a href=\"{}\">Next &gt;</a>", escape(&link(path, &params)));
    }
    html.push_str("</div>\n");
}

fn header(html: &mut String, title: &str, user: &CurrentUser, ctx: &PageContext) {
    let _ = writeln!(html, "<h1>{}</h1>", escape(title));
    let _ = writeln!(
        html,
        "<p class=\"username\">Logged in as {}</p>",
        escape(user.name())
    );
    let people = ctx.url_for(PEOPLE_PAGE).unwrap_or_else(|| "/people".to_string());
    let companies = ctx
        .url_for(COMPANY_PAGE)
        .unwrap_or_else(|| "/company".to_string());
    let _ = writeln!(
        html,
        "<nav><a href=\"{}\">People</a> | <a href=\"{}\">Companies</a></nav>",
        escape(&people),
        escape(&companies)
    );
}

#[derive(Serialize, Deserialize)]
struct CompanyState {
    provider: DataProvider<Company>,
    form: Company,
    page: u64,
}

/// Lists companies and adds or edits one through a form.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompanyPage;

impl CompanyPage {
    async fn state(ctx: &PageContext) -> Result<CompanyState, PageError> {
        if let Some(state) = ctx.load_state().await {
            return Ok(state);
        }
        Ok(CompanyState {
            provider: DataProvider::new(ctx.app().durable_session()?),
            form: Company::default(),
            page: 0,
        })
    }

    fn path(ctx: &PageContext) -> String {
        ctx.url_for(COMPANY_PAGE)
            .unwrap_or_else(|| "/company".to_string())
    }

    fn company_from_form(ctx: &PageContext) -> Result<Company, PageError> {
        Ok(Company {
            id: form_id(ctx)?,
            name: ctx.required("name")?,
            street: ctx.required("street")?,
            city: ctx.required("city")?,
            state: ctx.required("state")?,
            zip: ctx.required("zip")?,
        })
    }
}

#[async_trait]
impl Page for CompanyPage {
    fn title(&self) -> String {
        "Companies".to_string()
    }

    async fn render(&self, ctx: &mut PageContext) -> Result<String, PageError> {
        let user = ctx.app().require::<CurrentUser>()?;
        let mut state = Self::state(ctx).await?;
        apply_listing(ctx, &mut state.page, &mut state.provider)?;

        if ctx.query_param("new").is_some() {
            state.form = Company::default();
        }
        if let Some(edit) = ctx.query_param("edit") {
            let id = parse_id(edit, "company id")?;
            let mut session = ctx.unit_of_work()?.get().await?;
            state.form = session
                .find::<Company>(id)
                .await?
                .ok_or_else(|| PageError::NotFound(format!("company {}", id)))?;
        }

        let total = state.provider.size().await?;
        let first = clamp_page(&mut state.page, total);
        let rows = state.provider.iterator(first, PAGE_SIZE).await?;

        let path = Self::path(ctx);
        let people = ctx
            .url_for(PEOPLE_PAGE)
            .unwrap_or_else(|| "/people".to_string());
        let mut html = String::new();
        header(&mut html, "Companies", &user, ctx);

        let form = &state.form;
        let _ = writeln!(html, "<form method=\"post\" action=\"{}\" id=\"form\">", escape(&path));
        let _ = writeln!(
            html,
            "<input type=\"hidden\" name=\"id\" value=\"{}\">",
            form.id().map(|id| id.to_string()).unwrap_or_default()
        );
        text_input(&mut html, "name", "Name", &form.name, true);
        text_input(&mut html, "street", "Street", &form.street, true);
        text_input(&mut html, "city", "City", &form.city, true);
        text_input(&mut html, "state", "State", &form.state, true);
        text_input(&mut html, "zip", "Zip", &form.zip, true);
        let _ = writeln!(
            html,
            "<button type=\"submit\" id=\"update-button\">{}</button> <a href=\"{}\" id=\"cancel-button\">Cancel</a>",
            if form.id().is_some() { "Update" } else { "New" },
            escape(&link(&path, &[("new", "1".to_string())]))
        );
        html.push_str("</form>\n");

        let flip = if state.provider.is_ascending() { "desc" } else { "asc" };
        let _ = writeln!(
            html,
            "<table id=\"company-table\">\n<tr><th></th><th><a href=\"{}\">Name</a></th><th>Street</th><th>City</th><th>State</th><th>Zip</th></tr>",
            escape(&link(&path, &[("sort", flip.to_string())]))
        );
        for company in &rows {
            let _ = writeln!(
                html,
                "<tr><td><a href=\"{}\">edit</a></td><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape(&link(&path, &[("edit", company.id.to_string())])),
                escape(&link(&people, &[(COMPANYID_PARAM, company.id.to_string())])),
                escape(&company.name),
                escape(&company.street),
                escape(&company.city),
                escape(&company.state),
                escape(&company.zip)
            );
        }
        html.push_str("</table>\n");
        pager(&mut html, &[], &path, state.page, total);

        ctx.save_state(&state).await?;
        Ok(html)
    }

    async fn submit(&self, ctx: &mut PageContext) -> Result<PageResponse, PageError> {
        let path = Self::path(ctx);
        let mut company = match Self::company_from_form(ctx) {
            Ok(company) => company,
            Err(PageError::BadRequest(message)) => {
                ctx.flash(message).await?;
                return Ok(PageResponse::Redirect(path));
            }
            Err(e) => return Err(e),
        };

        save_and_report(ctx, &mut company).await?;

        let mut state = Self::state(ctx).await?;
        state.form = Company::default();
        ctx.save_state(&state).await?;
        Ok(PageResponse::Redirect(path))
    }
}

#[derive(Serialize, Deserialize)]
struct PeopleState {
    provider: DataProvider<Person>,
    company_id: Option<i64>,
    form: Person,
    page: u64,
}

/// Lists people, optionally only those of one company, and adds or edits one.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeoplePage;

impl PeoplePage {
    fn company_id(ctx: &PageContext) -> Result<Option<i64>, PageError> {
        let value = ctx
            .query_param(COMPANYID_PARAM)
            .or_else(|| ctx.form_value(COMPANYID_PARAM))
            .map(str::trim)
            .filter(|v| !v.is_empty());
        value.map(|v| parse_id(v, "company id")).transpose()
    }

    /// Saved state unless it belongs to a different company listing.
    async fn state(ctx: &PageContext, company_id: Option<i64>) -> Result<PeopleState, PageError> {
        if let Some(state) = ctx.load_state::<PeopleState>().await {
            if state.company_id == company_id {
                return Ok(state);
            }
        }
        let session = ctx.app().durable_session()?;
        let provider = match company_id {
            Some(id) => DataProvider::filtered(session, Filter::eq("company_id", id)),
            None => DataProvider::new(session),
        };
        Ok(PeopleState {
            provider,
            company_id,
            form: Person {
                company_id,
                ..Default::default()
            },
            page: 0,
        })
    }

    fn person_from_form(ctx: &PageContext, company_id: Option<i64>) -> Result<Person, PageError> {
        Ok(Person {
            id: form_id(ctx)?,
            name: ctx.required("name")?,
            email: ctx.required("email")?,
            phone: ctx.required("phone")?,
            company_id,
        })
    }

    fn path(ctx: &PageContext, company_id: Option<i64>) -> String {
        let base = ctx.url_for(PEOPLE_PAGE).unwrap_or_else(|| "/people".to_string());
        match company_id {
            Some(id) => link(&base, &[(COMPANYID_PARAM, id.to_string())]),
            None => base,
        }
    }
}

#[async_trait]
impl Page for PeoplePage {
    fn title(&self) -> String {
        "People".to_string()
    }

    async fn render(&self, ctx: &mut PageContext) -> Result<String, PageError> {
        let user = ctx.app().require::<CurrentUser>()?;
        let company_id = Self::company_id(ctx)?;
        let mut state = Self::state(ctx, company_id).await?;
        apply_listing(ctx, &mut state.page, &mut state.provider)?;

        let mut names: HashMap<i64, String> = HashMap::new();
        {
            let mut session = ctx.unit_of_work()?.get().await?;
            if let Some(id) = company_id {
                let company = session
                    .find::<Company>(id)
                    .await?
                    .ok_or_else(|| PageError::NotFound(format!("company {}", id)))?;
                names.insert(id, company.name);
            }
            if ctx.query_param("new").is_some() {
                state.form = Person {
                    company_id,
                    ..Default::default()
                };
            }
            if let Some(edit) = ctx.query_param("edit") {
                let id = parse_id(edit, "person id")?;
                state.form = session
                    .find::<Person>(id)
                    .await?
                    .ok_or_else(|| PageError::NotFound(format!("person {}", id)))?;
            }
        }

        let total = state.provider.size().await?;
        let first = clamp_page(&mut state.page, total);
        let rows = state.provider.iterator(first, PAGE_SIZE).await?;
        {
            let mut session = ctx.unit_of_work()?.get().await?;
            for id in rows.iter().filter_map(|p| p.company_id) {
                if !names.contains_key(&id) {
                    if let Some(company) = session.find::<Company>(id).await? {
                        names.insert(id, company.name);
                    }
                }
            }
        }

        let base = ctx.url_for(PEOPLE_PAGE).unwrap_or_else(|| "/people".to_string());
        let path = Self::path(ctx, company_id);
        let keep: Vec<(&str, String)> = company_id
            .map(|id| vec![(COMPANYID_PARAM, id.to_string())])
            .unwrap_or_default();
        let with = |extra: (&'static str, String)| {
            let mut params = keep.clone();
            params.push(extra);
            link(&base, &params)
        };

        let mut html = String::new();
        let title = match company_id.and_then(|id| names.get(&id)) {
            Some(company) => format!("People at {}", company),
            None => "People".to_string(),
        };
        header(&mut html, &title, &user, ctx);

        let form = &state.form;
        let form_company = form
            .company_id
            .and_then(|id| names.get(&id))
            .cloned()
            .unwrap_or_default();
        let _ = writeln!(html, "<form method=\"post\" action=\"{}\" id=\"form\">", escape(&path));
        let _ = writeln!(
            html,
            "<input type=\"hidden\" name=\"id\" value=\"{}\">",
            form.id().map(|id| id.to_string()).unwrap_or_default()
        );
        let _ = writeln!(
            html,
            "<input type=\"hidden\" name=\"{}\" value=\"{}\">",
            COMPANYID_PARAM,
            form.company_id.map(|id| id.to_string()).unwrap_or_default()
        );
        text_input(&mut html, "name", "Name", &form.name, true);
        text_input(&mut html, "email", "Email", &form.email, true);
        text_input(&mut html, "phone", "Phone", &form.phone, true);
        text_input(&mut html, "company", "Company", &form_company, false);
        let _ = writeln!(
            html,
            "<button type=\"submit\" id=\"update-button\">{}</button> <a href=\"{}\" id=\"cancel-button\">Cancel</a>",
            if form.id().is_some() { "Update" } else { "New" },
            escape(&with(("new", "1".to_string())))
        );
        html.push_str("</form>\n");

        let flip = if state.provider.is_ascending() { "desc" } else { "asc" };
        let _ = writeln!(
            html,
            "<table id=\"people-table\">\n<tr><th></th><th><a href=\"{}\">Name</a></th><th>Email</th><th>Phone</th><th>Company</th></tr>",
            escape(&with(("sort", flip.to_string())))
        );
        for person in &rows {
            let company = person
                .company_id
                .and_then(|id| names.get(&id))
                .map(String::as_str)
                .unwrap_or("");
            let _ = writeln!(
                html,
                "<tr><td><a href=\"{}\">edit</a></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape(&with(("edit", person.id.to_string()))),
                escape(&person.name),
                escape(&person.email),
                escape(&person.phone),
                escape(company)
            );
        }
        html.push_str("</table>\n");
        pager(&mut html, &keep, &base, state.page, total);

        ctx.save_state(&state).await?;
        Ok(html)
    }

    async fn submit(&self, ctx: &mut PageContext) -> Result<PageResponse, PageError> {
        let company_id = Self::company_id(ctx)?;
        let path = Self::path(ctx, company_id);

        let mut person = match Self::person_from_form(ctx, company_id) {
            Ok(person) => person,
            Err(PageError::BadRequest(message)) => {
                ctx.flash(message).await?;
                return Ok(PageResponse::Redirect(path));
            }
            Err(e) => return Err(e),
        };

        save_and_report(ctx, &mut person).await?;

        let mut state = Self::state(ctx, company_id).await?;
        state.form = Person {
            company_id,
            ..Default::default()
        };
        ctx.save_state(&state).await?;
        Ok(PageResponse::Redirect(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_page_stays_within_the_rows() {
        let mut page = u64::MAX;
        assert_eq!(clamp_page(&mut page, 45), 40);
        assert_eq!(page, 2);

        let mut page = 1;
        assert_eq!(clamp_page(&mut page, 0), 0);
        assert_eq!(page, 0);

        let mut page = 1;
        assert_eq!(clamp_page(&mut page, 40), 20);
        assert_eq!(page, 1);
    }
}
