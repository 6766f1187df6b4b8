//! Client for the legislative open-data API + scripted test source.
//!
//! The provider is treated as an opaque paginated HTTP resource: JSON
//! envelopes with a `dados` array and `links[].rel == "next"/"last"`
//! pagination. Per-item decoding is deliberately lenient because the API
//! mixes numbers and numeric strings in id fields; malformed items are
//! surfaced as `None` from the typed accessors and skipped upstream.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use lbt_core::{ProcedureStep, ReferenceKind};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "lbt-provider";

pub const DEFAULT_BASE_URL: &str = "https://dadosabertos.camara.leg.br/api/v2";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("unpaginatable cursor: {0}")]
    BadCursor(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-delay retry budget applied per request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    #[serde(default)]
    dados: Vec<JsonValue>,
    #[serde(default)]
    links: Vec<PageLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageLink {
    pub rel: String,
    pub href: String,
}

pub fn link_href<'a>(links: &'a [PageLink], rel: &str) -> Option<&'a str> {
    links
        .iter()
        .find(|link| link.rel == rel)
        .map(|link| link.href.as_str())
}

/// Extract the `pagina` query parameter from a pagination href.
pub fn page_param(href: &str) -> Option<u32> {
    let start = href.find("pagina=")? + "pagina=".len();
    let digits: String = href[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Accept JSON numbers and numeric strings; anything else is malformed.
pub fn coerce_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Event timestamps arrive as ISO-8601 without an offset, sometimes
/// without seconds.
pub fn parse_event_time(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M"))
        .ok()
}

fn item_from_value<T: serde::de::DeserializeOwned + Default>(value: JsonValue) -> T {
    // Non-object entries decode to the all-null default and are treated as
    // malformed by the typed accessors.
    serde_json::from_value(value).unwrap_or_default()
}

/// One `{cod, nome}` entry from a reference-code or topic endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCodeItem {
    #[serde(default)]
    pub cod: JsonValue,
    #[serde(default)]
    pub nome: Option<String>,
}

impl RawCodeItem {
    pub fn new(cod: i64, nome: &str) -> Self {
        Self {
            cod: JsonValue::from(cod),
            nome: Some(nome.to_string()),
        }
    }

    pub fn code(&self) -> Option<i64> {
        coerce_i64(&self.cod)
    }

    pub fn to_reference_item(&self) -> Option<lbt_core::ReferenceItem> {
        let external_id = self.code()?;
        let label = self.nome.as_deref()?.trim();
        if label.is_empty() {
            return None;
        }
        Some(lbt_core::ReferenceItem {
            external_id,
            label: label.to_string(),
        })
    }
}

/// A bill summary from the paginated listing endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBillSummary {
    #[serde(default)]
    pub id: JsonValue,
    #[serde(default)]
    pub ementa: Option<String>,
    #[serde(default, rename = "siglaTipo")]
    pub sigla_tipo: Option<String>,
    #[serde(default)]
    pub numero: JsonValue,
    #[serde(default)]
    pub ano: JsonValue,
}

impl RawBillSummary {
    pub fn new(id: i64, ementa: &str, sigla_tipo: &str, numero: i64, ano: i32) -> Self {
        Self {
            id: JsonValue::from(id),
            ementa: Some(ementa.to_string()),
            sigla_tipo: Some(sigla_tipo.to_string()),
            numero: JsonValue::from(numero),
            ano: JsonValue::from(ano),
        }
    }

    pub fn external_id(&self) -> Option<i64> {
        coerce_i64(&self.id)
    }

    pub fn year(&self) -> Option<i32> {
        coerce_i64(&self.ano).and_then(|y| i32::try_from(y).ok())
    }

    /// Short human descriptor, e.g. `PL 2338/2023`.
    pub fn descriptor(&self) -> String {
        let kind = self.sigla_tipo.as_deref().unwrap_or("?");
        let number = coerce_i64(&self.numero)
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        let year = coerce_i64(&self.ano)
            .map(|y| y.to_string())
            .unwrap_or_else(|| "?".to_string());
        format!("{kind} {number}/{year}")
    }
}

/// One procedural-step record from a bill's history endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStep {
    #[serde(default)]
    pub sequencia: JsonValue,
    #[serde(default, rename = "dataHora")]
    pub data_hora: Option<String>,
    #[serde(default, rename = "codSituacao")]
    pub cod_situacao: JsonValue,
    #[serde(default, rename = "codTipoTramitacao")]
    pub cod_tipo_tramitacao: JsonValue,
    #[serde(default, rename = "siglaOrgao")]
    pub sigla_orgao: Option<String>,
    #[serde(default)]
    pub despacho: Option<String>,
}

impl RawStep {
    pub fn new(sequencia: i64, data_hora: &str, cod_situacao: i64, cod_tipo: i64) -> Self {
        Self {
            sequencia: JsonValue::from(sequencia),
            data_hora: Some(data_hora.to_string()),
            cod_situacao: JsonValue::from(cod_situacao),
            cod_tipo_tramitacao: JsonValue::from(cod_tipo),
            sigla_orgao: None,
            despacho: None,
        }
    }

    pub fn with_agency(mut self, sigla_orgao: &str, despacho: &str) -> Self {
        self.sigla_orgao = Some(sigla_orgao.to_string());
        self.despacho = Some(despacho.to_string());
        self
    }

    pub fn sequence(&self) -> Option<i64> {
        coerce_i64(&self.sequencia)
    }

    pub fn event_time(&self) -> Option<NaiveDateTime> {
        self.data_hora.as_deref().and_then(parse_event_time)
    }

    pub fn status_code(&self) -> Option<i64> {
        coerce_i64(&self.cod_situacao)
    }

    pub fn step_type_code(&self) -> Option<i64> {
        coerce_i64(&self.cod_tipo_tramitacao)
    }

    /// Strict conversion: every step field the store requires must parse,
    /// otherwise the step is individually skippable.
    pub fn to_step(&self, bill_id: i64) -> Option<ProcedureStep> {
        Some(ProcedureStep {
            bill_id,
            sequence_number: self.sequence()?,
            event_time: self.event_time()?,
            status_ref: self.status_code()?,
            step_type_ref: self.step_type_code()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Source contract
// ---------------------------------------------------------------------------

/// Parameters for the bill listing endpoint. Page numbering is 1-based.
#[derive(Debug, Clone, Default)]
pub struct ListingQuery {
    pub page: u32,
    pub page_size: u32,
    pub years: Vec<i32>,
    pub modified_since: Option<NaiveDate>,
    pub modified_until: Option<NaiveDate>,
}

/// One page of bill summaries plus pagination metadata.
#[derive(Debug, Clone, Default)]
pub struct BillPage {
    pub items: Vec<RawBillSummary>,
    /// Opaque cursor for the following page, fed back to [`BillSource::next_page`].
    pub next: Option<String>,
    /// Total page count when the source advertised a `last` link.
    pub last_page: Option<u32>,
}

#[async_trait]
pub trait BillSource: Send + Sync {
    async fn reference_items(&self, kind: ReferenceKind) -> Result<Vec<RawCodeItem>, SourceError>;

    async fn list_bills(&self, query: &ListingQuery) -> Result<BillPage, SourceError>;

    /// Follow a `next` cursor returned by a previous page verbatim.
    async fn next_page(&self, cursor: &str) -> Result<BillPage, SourceError>;

    async fn bill_steps(&self, external_id: i64) -> Result<Vec<RawStep>, SourceError>;

    async fn bill_topics(&self, external_id: i64) -> Result<Vec<RawCodeItem>, SourceError>;
}

fn reference_endpoint(kind: ReferenceKind) -> &'static str {
    match kind {
        ReferenceKind::Status => "codSituacao",
        ReferenceKind::StepType => "codTipoTramitacao",
        ReferenceKind::Topic => "codTema",
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct CamaraClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl CamaraClient {
    pub fn new(config: ClientConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: config.retry,
        })
    }

    fn listing_url(&self, query: &ListingQuery) -> String {
        let mut url = format!(
            "{}/proposicoes?pagina={}&itens={}&ordem=ASC&ordenarPor=id",
            self.base_url,
            query.page.max(1),
            query.page_size.max(1),
        );
        for year in &query.years {
            url.push_str(&format!("&ano={year}"));
        }
        if let Some(since) = query.modified_since {
            url.push_str(&format!("&dataInicio={}", since.format("%Y-%m-%d")));
        }
        if let Some(until) = query.modified_until {
            url.push_str(&format!("&dataFim={}", until.format("%Y-%m-%d")));
        }
        url
    }

    async fn get_envelope(&self, url: &str) -> Result<Envelope, SourceError> {
        let span = info_span!("provider_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.retry.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.json::<Envelope>().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries
                    {
                        tokio::time::sleep(self.retry.delay).await;
                        continue;
                    }

                    return Err(SourceError::Status {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.retry.delay).await;
                        continue;
                    }
                    return Err(SourceError::Http(err));
                }
            }
        }

        Err(SourceError::Http(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }

    async fn get_page(&self, url: &str) -> Result<BillPage, SourceError> {
        let envelope = self.get_envelope(url).await?;
        let next = link_href(&envelope.links, "next").map(ToString::to_string);
        let last_page = link_href(&envelope.links, "last").and_then(page_param);
        let items = envelope.dados.into_iter().map(item_from_value).collect();
        Ok(BillPage {
            items,
            next,
            last_page,
        })
    }
}

#[async_trait]
impl BillSource for CamaraClient {
    async fn reference_items(&self, kind: ReferenceKind) -> Result<Vec<RawCodeItem>, SourceError> {
        let url = format!(
            "{}/referencias/proposicoes/{}",
            self.base_url,
            reference_endpoint(kind)
        );
        let envelope = self.get_envelope(&url).await?;
        Ok(envelope.dados.into_iter().map(item_from_value).collect())
    }

    async fn list_bills(&self, query: &ListingQuery) -> Result<BillPage, SourceError> {
        self.get_page(&self.listing_url(query)).await
    }

    async fn next_page(&self, cursor: &str) -> Result<BillPage, SourceError> {
        self.get_page(cursor).await
    }

    async fn bill_steps(&self, external_id: i64) -> Result<Vec<RawStep>, SourceError> {
        let url = format!("{}/proposicoes/{external_id}/tramitacoes", self.base_url);
        let envelope = self.get_envelope(&url).await?;
        Ok(envelope.dados.into_iter().map(item_from_value).collect())
    }

    async fn bill_topics(&self, external_id: i64) -> Result<Vec<RawCodeItem>, SourceError> {
        let url = format!("{}/proposicoes/{external_id}/temas", self.base_url);
        let envelope = self.get_envelope(&url).await?;
        Ok(envelope.dados.into_iter().map(item_from_value).collect())
    }
}

// ---------------------------------------------------------------------------
// Scripted in-memory source (tests, offline runs)
// ---------------------------------------------------------------------------

const SCRIPTED_CURSOR_PREFIX: &str = "scripted:page=";

#[derive(Debug, Default)]
struct ScriptedState {
    reference: HashMap<ReferenceKind, Vec<RawCodeItem>>,
    pages: Vec<Vec<RawBillSummary>>,
    steps: HashMap<i64, Vec<RawStep>>,
    topics: HashMap<i64, Vec<RawCodeItem>>,
    fail_listings: u32,
    fail_reference: u32,
    fail_steps_for: Vec<i64>,
    listing_calls_made: u32,
    fail_listing_calls: Vec<u32>,
}

/// A [`BillSource`] backed by in-memory fixtures, mutable between cycles so
/// tests can evolve the upstream snapshot and inject transient failures.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    state: Mutex<ScriptedState>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reference(&self, kind: ReferenceKind, items: Vec<RawCodeItem>) {
        self.lock().reference.insert(kind, items);
    }

    pub fn set_pages(&self, pages: Vec<Vec<RawBillSummary>>) {
        self.lock().pages = pages;
    }

    pub fn push_page(&self, items: Vec<RawBillSummary>) {
        self.lock().pages.push(items);
    }

    pub fn set_steps(&self, external_id: i64, steps: Vec<RawStep>) {
        self.lock().steps.insert(external_id, steps);
    }

    pub fn set_topics(&self, external_id: i64, topics: Vec<RawCodeItem>) {
        self.lock().topics.insert(external_id, topics);
    }

    /// The next `n` listing fetches (initial or cursor-driven) fail with a 503.
    pub fn fail_next_listings(&self, n: u32) {
        self.lock().fail_listings = n;
    }

    /// The next `n` reference fetches fail with a 503.
    pub fn fail_next_reference(&self, n: u32) {
        self.lock().fail_reference = n;
    }

    /// Fail the nth upcoming listing fetch (1-based across initial and
    /// cursor-driven fetches), leaving surrounding fetches untouched.
    pub fn fail_listing_call(&self, index: u32) {
        let mut state = self.lock();
        let absolute = state.listing_calls_made + index;
        state.fail_listing_calls.push(absolute);
    }

    /// Step-history fetches for this bill fail with a 503 until cleared.
    pub fn fail_steps_for(&self, external_id: i64) {
        self.lock().fail_steps_for.push(external_id);
    }

    pub fn clear_step_failures(&self) {
        self.lock().fail_steps_for.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.state.lock().expect("scripted source mutex poisoned")
    }

    fn page_at(state: &ScriptedState, page: u32) -> BillPage {
        let index = page.saturating_sub(1) as usize;
        let items = state.pages.get(index).cloned().unwrap_or_default();
        let next = if index + 1 < state.pages.len() {
            Some(format!("{SCRIPTED_CURSOR_PREFIX}{}", page + 1))
        } else {
            None
        };
        BillPage {
            items,
            next,
            last_page: Some(state.pages.len().max(1) as u32),
        }
    }

    fn scripted_unavailable(what: &str) -> SourceError {
        SourceError::Status {
            status: 503,
            url: format!("scripted:{what}"),
        }
    }

    fn listing_gate(state: &mut ScriptedState) -> Result<(), SourceError> {
        state.listing_calls_made += 1;
        if state.fail_listings > 0 {
            state.fail_listings -= 1;
            return Err(Self::scripted_unavailable("listing"));
        }
        if state.fail_listing_calls.contains(&state.listing_calls_made) {
            return Err(Self::scripted_unavailable("listing"));
        }
        Ok(())
    }
}

#[async_trait]
impl BillSource for ScriptedSource {
    async fn reference_items(&self, kind: ReferenceKind) -> Result<Vec<RawCodeItem>, SourceError> {
        let mut state = self.lock();
        if state.fail_reference > 0 {
            state.fail_reference -= 1;
            return Err(Self::scripted_unavailable("reference"));
        }
        Ok(state.reference.get(&kind).cloned().unwrap_or_default())
    }

    async fn list_bills(&self, query: &ListingQuery) -> Result<BillPage, SourceError> {
        let mut state = self.lock();
        Self::listing_gate(&mut state)?;
        Ok(Self::page_at(&state, query.page.max(1)))
    }

    async fn next_page(&self, cursor: &str) -> Result<BillPage, SourceError> {
        let page: u32 = cursor
            .strip_prefix(SCRIPTED_CURSOR_PREFIX)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| SourceError::BadCursor(cursor.to_string()))?;
        let mut state = self.lock();
        Self::listing_gate(&mut state)?;
        Ok(Self::page_at(&state, page))
    }

    async fn bill_steps(&self, external_id: i64) -> Result<Vec<RawStep>, SourceError> {
        let state = self.lock();
        if state.fail_steps_for.contains(&external_id) {
            return Err(Self::scripted_unavailable("steps"));
        }
        Ok(state.steps.get(&external_id).cloned().unwrap_or_default())
    }

    async fn bill_topics(&self, external_id: i64) -> Result<Vec<RawCodeItem>, SourceError> {
        let state = self.lock();
        Ok(state.topics.get(&external_id).cloned().unwrap_or_default())
    }
}
