use std::{env, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Row,
};
use tokio::{sync::Mutex, task::JoinSet};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::{
    prompting::{render_system_prompt, SystemPromptContext},
    types::{Agent, ContactAddress, InboundJob, KnowledgeItem, ListJobsQuery, ProcessRequestBody, WebhookMessage},
};

const BATCH_DEBOUNCE_SECS: i64 = 15;
const LOCK_STALE_AFTER_SECS: i64 = 120;
const AGENCY_REFRESH_MARGIN_SECS: i64 = 120;
const SCHEDULE_POLL_BUDGET: usize = 25;
const SCHEDULE_POLL_CAP_MS: i64 = 2000;
const GENERATION_MAX_ROUNDS: usize = 3;
const HISTORY_TAIL: usize = 10;
const KB_TOP_K: i32 = 10;
const KB_CONTEXT_MAX: usize = 5;
const KB_SIMILARITY_THRESHOLD: f64 = 0.7;
const EMBEDDING_MODEL: &str = "text-embedding-3-small";
const EMBEDDING_DIM: usize = 1536;
const GEMINI_MODEL: &str = "gemini-2.5-flash-lite";
const CONTACT_SNAPSHOT_MAX: usize = 3500;
const GHL_MESSAGES_VERSION: &str = "2021-04-15";
const GHL_CONTACTS_VERSION: &str = "2021-07-28";

const REPLY_GENERIC_FAILURE: &str = "Desculpe, tive um problema ao processar sua mensagem.";
const REPLY_NO_ANSWER: &str = "Desculpe, não consegui formular uma resposta.";
const REPLY_SAFE_BLOCKED: &str =
    "No momento não consegui acessar essa informação com segurança. Por favor, tente novamente em alguns minutos.";
const REPLY_SNAPSHOT_UNAVAILABLE: &str =
    "No momento não consegui acessar as informações do seu cadastro. Por favor, tente novamente em alguns minutos.";
const REPLY_COMPANY_UPDATE_ASK_NAME: &str =
    "Entendi. Para eu atualizar a empresa no seu cadastro, me diga o nome exato da empresa.";
const REPLY_COMPANY_UPDATE_FAILED: &str =
    "No momento não consegui atualizar a empresa no seu cadastro. Por favor, tente novamente em alguns minutos.";
const REPLY_CORRECTION_ASK_NAME: &str =
    "Entendi. No momento não consegui identificar com segurança qual é a empresa correta para atualizar. Você pode me confirmar o nome completo da empresa?";
const REPLY_COMPANY_UNAVAILABLE: &str =
    "No momento não consegui acessar a empresa cadastrada no seu cadastro. Por favor, tente novamente em alguns minutos.";
const REPLY_ADDRESS_UNAVAILABLE: &str =
    "No momento não consegui acessar o endereço do seu cadastro. Por favor, tente novamente em alguns minutos.";
const REPLY_ADDRESS_EMPTY: &str = "No momento não encontrei endereço cadastrado no seu cadastro.";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub ghl_api_url: String,
    pub ghl_client_id: String,
    pub ghl_client_secret: String,
    pub ghl_company_id: String,
    pub ghl_redirect_uri: String,
    pub gemini_api_url: String,
    pub gemini_api_key: String,
    pub openai_api_url: String,
    pub openai_api_key: Option<String>,
    pub webhook_secret: Option<String>,
}

pub struct AppState {
    pub db: PgPool,
    pub http: reqwest::Client,
    pub config: Config,
    pub batch_tasks: Mutex<JoinSet<()>>,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "agent_server".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn load_config() -> Result<Config, String> {
    let required = [
        "GHL_CLIENT_ID",
        "GHL_CLIENT_SECRET",
        "GHL_COMPANY_ID",
        "GHL_AUTH_REDIRECT_URI",
        "GEMINI_API_KEY",
    ];
    let missing = required
        .iter()
        .filter(|key| {
            env::var(**key)
                .map(|value| value.trim().is_empty())
                .unwrap_or(true)
        })
        .map(|key| key.to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(format!(
            "missing required environment variables: {}",
            missing.join(", ")
        ));
    }
    Ok(Config {
        port: env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(4000),
        database_url: resolve_database_url(),
        ghl_api_url: env_or("GHL_API_URL", "https://services.leadconnectorhq.com"),
        ghl_client_id: env_or("GHL_CLIENT_ID", ""),
        ghl_client_secret: env_or("GHL_CLIENT_SECRET", ""),
        ghl_company_id: env_or("GHL_COMPANY_ID", ""),
        ghl_redirect_uri: env_or("GHL_AUTH_REDIRECT_URI", ""),
        gemini_api_url: env_or("GEMINI_API_URL", "https://generativelanguage.googleapis.com"),
        gemini_api_key: env_or("GEMINI_API_KEY", ""),
        openai_api_url: env_or("OPENAI_API_URL", "https://api.openai.com"),
        openai_api_key: env::var("OPENAI_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty()),
        webhook_secret: env::var("INBOUND_WEBHOOK_SECRET")
            .ok()
            .filter(|value| !value.trim().is_empty()),
    })
}

fn verify_webhook_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

fn to_short_json(value: &Value, max_len: usize) -> String {
    let Ok(serialized) = serde_json::to_string(value) else {
        return String::new();
    };
    if serialized.len() <= max_len {
        return serialized;
    }
    let clipped = serialized.chars().take(max_len).collect::<String>();
    format!("{clipped}...(truncated)")
}

fn strip_bearer(token: &str) -> String {
    let trimmed = token.trim();
    match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => trimmed[7..].trim().to_string(),
        _ => trimmed.to_string(),
    }
}

// --- Webhook envelope decoding -------------------------------------------

/// Ordered shape matchers: provider array wrap, then body wrap, then the
/// payload as-is.
fn unwrap_webhook_payload(input: &Value) -> Value {
    if let Some(first) = input.as_array().and_then(|entries| entries.first()) {
        let inner = first.get("body").unwrap_or(first);
        return unwrap_webhook_payload(inner);
    }
    if let Some(inner) = input.get("body") {
        if looks_like_message(inner) {
            return inner.clone();
        }
    }
    input.clone()
}

fn looks_like_message(value: &Value) -> bool {
    value.is_object()
        && [
            "type",
            "messageId",
            "message_id",
            "messageType",
            "message_type",
            "conversationId",
            "conversation_id",
        ]
        .iter()
        .any(|key| value.get(*key).is_some())
}

fn resolve_message_id(message: &WebhookMessage) -> String {
    for candidate in [&message.message_id, &message.webhook_id] {
        if let Some(id) = candidate.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            return id.to_string();
        }
    }
    let conversation = message
        .conversation_id
        .as_deref()
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown");
    let stamp = message
        .date_added
        .clone()
        .filter(|v| !v.is_empty())
        .or_else(|| {
            message.timestamp.as_ref().map(|t| match t {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| Utc::now().timestamp_millis().to_string());
    format!("{conversation}:{stamp}")
}

// --- Intent heuristics ----------------------------------------------------

fn should_block_internal_id_request(text: &str) -> bool {
    let Ok(re) = Regex::new(
        r"(?i)(\bid\s+do(?:\s+\w+){0,3}\s+contato\b)|(\bc[oó]digo\s+do(?:\s+\w+){0,3}\s+contato\b)|(\bcontact\s*id\b)|(\bcontactid\b)",
    ) else {
        return false;
    };
    re.is_match(text)
}

fn keyword_wants_contact_snapshot(text: &str) -> bool {
    let t = text.to_lowercase();
    [
        "processo",
        "andamento",
        "status",
        "etapa",
        "funil",
        "pipeline",
        "proposta",
        "orçamento",
        "orcamento",
        "empresa",
        "cadastro",
        "cadastrada",
        "cadastrado",
        "valor",
        "valores",
        "preço",
        "preco",
        "fase",
        "meu cadastro",
        "meus dados",
        "dados",
        "informações",
        "informacoes",
        "email",
        "e-mail",
        "telefone",
        "celular",
        "endereço",
        "endereco",
        "nome",
    ]
    .iter()
    .any(|keyword| t.contains(keyword))
}

fn is_company_question(text: &str) -> bool {
    let t = text.to_lowercase();
    if !t.contains("empresa") {
        return false;
    }
    ["cadastr", "trabalho", "registr"].iter().any(|k| t.contains(k))
}

fn is_company_correction(text: &str) -> bool {
    let t = text.to_lowercase();
    if !t.contains("não é") && !t.contains("nao e") {
        return false;
    }
    if !t.contains(" é ") && !t.contains(" e ") {
        return false;
    }
    ["ltda", "s/a", "sa", "me", "eireli", "inc", "llc"]
        .iter()
        .any(|k| t.contains(k))
        || t.contains("empresa")
}

fn is_company_update_request(text: &str) -> bool {
    let t = text.to_lowercase();
    if !t.contains("empresa") {
        return false;
    }
    [
        "alter", "atualiz", "muda", "mudar", "troca", "trocar", "corrig", "coloc", "seta", "setar",
    ]
    .iter()
    .any(|k| t.contains(k))
}

fn is_address_question(text: &str) -> bool {
    let t = text.to_lowercase();
    [
        "endereço", "endereco", "rua", "cep", "bairro", "cidade", "estado", "uf", "país", "pais",
    ]
    .iter()
    .any(|k| t.contains(k))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageIntent {
    CompanyUpdate,
    CompanyCorrection,
    CompanyQuestion,
    AddressQuestion,
}

// Ordered chain: the first matching predicate decides the deterministic
// path; everything else goes to the generation loop.
const INTENT_MATCHERS: &[(fn(&str) -> bool, MessageIntent)] = &[
    (is_company_update_request, MessageIntent::CompanyUpdate),
    (is_company_correction, MessageIntent::CompanyCorrection),
    (is_company_question, MessageIntent::CompanyQuestion),
    (is_address_question, MessageIntent::AddressQuestion),
];

fn classify_intent(text: &str) -> Option<MessageIntent> {
    INTENT_MATCHERS
        .iter()
        .find(|(predicate, _)| predicate(text))
        .map(|(_, intent)| *intent)
}

fn extract_company_from_update_request(text: &str) -> String {
    let raw = text.trim();
    let Ok(re) = Regex::new(r"(?i)\b(?:para|pra|p/)\s+(.+)$") else {
        return String::new();
    };
    let Some(caps) = re.captures(raw) else {
        return String::new();
    };
    let target = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let Ok(strip) = Regex::new(r"[?!\s]+$") else {
        return target.trim().to_string();
    };
    strip.replace(target, "").trim().to_string()
}

fn extract_company_from_user_correction(text: &str) -> String {
    let raw = text.trim();
    let lower = raw.to_lowercase();
    // " é " is four bytes in UTF-8, " e " is three.
    let accented = lower.rfind(" é ").map(|idx| (idx, " é ".len()));
    let plain = lower.rfind(" e ").map(|idx| (idx, " e ".len()));
    let best = match (accented, plain) {
        (Some(a), Some(b)) => Some(if b.0 > a.0 { b } else { a }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    let Some((idx, sep_len)) = best else {
        return String::new();
    };
    let Some(tail) = raw.get(idx + sep_len..) else {
        return String::new();
    };
    tail.trim_start_matches(|c: char| matches!(c, '.' | ':' | '-') || c.is_whitespace())
        .trim()
        .to_string()
}

fn contact_record(payload: &Value) -> &Value {
    payload
        .get("contact")
        .or_else(|| payload.get("data"))
        .unwrap_or(payload)
}

fn extract_company_name_from_contact_payload(payload: &Value) -> String {
    let record = contact_record(payload);
    [
        "companyName",
        "businessName",
        "company",
        "business_name",
        "company_name",
    ]
    .iter()
    .filter_map(|key| record.get(*key).and_then(Value::as_str))
    .map(str::trim)
    .find(|value| !value.is_empty())
    .map(str::to_string)
    .unwrap_or_default()
}

fn extract_address_from_contact_payload(payload: &Value) -> ContactAddress {
    let record = contact_record(payload);
    let field = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| record.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or("")
            .to_string()
    };
    ContactAddress {
        street: field(&["street", "address1", "address_1", "address"]),
        address2: field(&["address2", "address_2"]),
        city: field(&["city"]),
        state: field(&["state"]),
        postal_code: field(&["postalCode", "postal_code", "zip"]),
        country: field(&["country"]),
    }
}

fn compose_address_reply(address: &ContactAddress) -> String {
    let mut lines = Vec::new();
    if !address.street.is_empty() {
        lines.push(format!("- *Rua*: {}", address.street));
    }
    if !address.address2.is_empty() {
        lines.push(format!("- *Complemento*: {}", address.address2));
    }
    if !address.city.is_empty() {
        lines.push(format!("- *Cidade*: {}", address.city));
    }
    if !address.state.is_empty() {
        lines.push(format!("- *Estado*: {}", address.state));
    }
    if !address.postal_code.is_empty() {
        lines.push(format!("- *CEP*: {}", address.postal_code));
    }
    if !address.country.is_empty() {
        lines.push(format!("- *País*: {}", address.country));
    }
    let mut missing = Vec::new();
    if address.street.is_empty() {
        missing.push("Rua");
    }
    if address.state.is_empty() {
        missing.push("Estado");
    }
    if address.postal_code.is_empty() {
        missing.push("CEP");
    }
    if address.country.is_empty() {
        missing.push("País");
    }
    let mut reply = format!(
        "No seu cadastro, eu tenho estas informações de endereço:\n{}",
        lines.join("\n")
    );
    if !missing.is_empty() {
        reply.push_str(&format!("\n\nAinda não tenho: {}.", missing.join(", ")));
    }
    reply
}

// --- Outbound channel mapping --------------------------------------------

fn map_message_type_to_ghl(message_type: &str, conversation_provider_id: Option<&str>) -> String {
    if conversation_provider_id.map(|v| !v.is_empty()).unwrap_or(false) {
        return "SMS".to_string();
    }
    match message_type {
        "TYPE_SMS" | "SMS" => "SMS",
        "TYPE_EMAIL" | "Email" => "Email",
        "TYPE_WHATSAPP" | "WhatsApp" => "WhatsApp",
        "TYPE_INSTAGRAM" | "IG" => "IG",
        "TYPE_FACEBOOK" | "FB" => "FB",
        "TYPE_GMB" | "Custom" => "Custom",
        "TYPE_WEBCHAT" | "Live_Chat" => "Live_Chat",
        other => other,
    }
    .to_string()
}

fn infer_reply_channel(
    job: &InboundJob,
    meta_type: Option<String>,
    meta_provider: Option<String>,
    raw_payload: &Value,
) -> (String, Option<String>) {
    let payload_type = ["messageType", "message_type", "type"]
        .iter()
        .filter_map(|key| raw_payload.get(*key).and_then(Value::as_str))
        .find(|v| !v.is_empty())
        .map(str::to_string);
    let message_type = job
        .message_type
        .clone()
        .filter(|v| !v.is_empty())
        .or(meta_type.filter(|v| !v.is_empty()))
        .or(payload_type)
        .unwrap_or_else(|| "WhatsApp".to_string());

    let payload_provider = ["conversationProviderId", "conversation_provider_id"]
        .iter()
        .filter_map(|key| raw_payload.get(*key).and_then(Value::as_str))
        .find(|v| !v.is_empty())
        .map(str::to_string);
    let provider = job
        .conversation_provider_id
        .clone()
        .filter(|v| !v.is_empty())
        .or(meta_provider.filter(|v| !v.is_empty()))
        .or(payload_provider);

    (message_type, provider)
}

// --- Knowledge retrieval --------------------------------------------------

fn normalize_query_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn embedding_to_pgvector(embedding: &[f64]) -> String {
    let parts = embedding
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{parts}]")
}

async fn query_embedding(state: &Arc<AppState>, query: &str) -> Option<Vec<f64>> {
    let clean = normalize_query_text(query);
    if clean.is_empty() {
        return None;
    }
    let api_key = state.config.openai_api_key.as_deref()?;
    let response = state
        .http
        .post(format!("{}/v1/embeddings", state.config.openai_api_url))
        .bearer_auth(api_key)
        .json(&json!({
            "model": EMBEDDING_MODEL,
            "input": clean,
            "encoding_format": "float",
        }))
        .send()
        .await;
    let response = match response {
        Ok(res) if res.status().is_success() => res,
        Ok(res) => {
            tracing::warn!(status = %res.status(), "embedding request rejected");
            return None;
        }
        Err(err) => {
            tracing::warn!(error = %err, "embedding request failed");
            return None;
        }
    };
    let payload = response.json::<Value>().await.ok()?;
    let embedding = payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|data| data.first())
        .and_then(|item| item.get("embedding"))
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_f64)
        .collect::<Vec<_>>();
    if embedding.len() != EMBEDDING_DIM {
        tracing::warn!(
            got = embedding.len(),
            expected = EMBEDDING_DIM,
            "embedding dimension mismatch"
        );
        return None;
    }
    Some(embedding)
}

fn parse_knowledge_row(row: &PgRow) -> KnowledgeItem {
    KnowledgeItem {
        content: row.get("content"),
        content_type: row.get("content_type"),
        title: row.get("title"),
        url: row.get("url"),
    }
}

/// Vector search, then text search, then a plain listing. The mode label is
/// recorded in the decision trace.
async fn retrieve_knowledge_items(
    state: &Arc<AppState>,
    query: &str,
    kb_ids: &[String],
) -> (Vec<KnowledgeItem>, &'static str) {
    if kb_ids.is_empty() {
        return (vec![], "none");
    }
    let content_types = vec!["faq".to_string(), "chunk".to_string()];

    if let Some(embedding) = query_embedding(state, query).await {
        let vector = embedding_to_pgvector(&embedding);
        let rows = sqlx::query(
            "SELECT content, content_type, title, url \
             FROM search_knowledge_items($1::vector, $2, $3, $4, $5)",
        )
        .bind(vector)
        .bind(kb_ids)
        .bind(&content_types)
        .bind(KB_TOP_K)
        .bind(KB_SIMILARITY_THRESHOLD)
        .fetch_all(&state.db)
        .await
        .unwrap_or_default();
        if !rows.is_empty() {
            return (rows.iter().map(parse_knowledge_row).collect(), "vector");
        }
    }

    let rows = sqlx::query(
        "SELECT content, content_type, title, url \
         FROM search_knowledge_items_text($1, $2, $3, $4)",
    )
    .bind(normalize_query_text(query))
    .bind(kb_ids)
    .bind(&content_types)
    .bind(KB_TOP_K)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    if !rows.is_empty() {
        return (rows.iter().map(parse_knowledge_row).collect(), "text");
    }

    let rows = sqlx::query(
        "SELECT content, content_type, title, url FROM knowledge_items \
         WHERE knowledge_base_id = ANY($1) AND content_type = ANY($2) \
         ORDER BY created_at ASC LIMIT $3",
    )
    .bind(kb_ids)
    .bind(&content_types)
    .bind(KB_TOP_K)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    (rows.iter().map(parse_knowledge_row).collect(), "simple")
}

fn format_knowledge_context(items: &[KnowledgeItem]) -> String {
    items
        .iter()
        .take(KB_CONTEXT_MAX)
        .map(|item| {
            if item.content_type == "faq" {
                let question = item
                    .title
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .unwrap_or(&item.content);
                format!("Q: {question}\nA: {}", item.content)
            } else if let Some(url) = item.url.as_deref().filter(|u| !u.is_empty()) {
                format!("{}\n\nURL de referência: {url}", item.content)
            } else {
                item.content.clone()
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

// --- CRM token broker -----------------------------------------------------

fn location_token_valid(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now < expires_at
}

fn agency_token_needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at - ChronoDuration::seconds(AGENCY_REFRESH_MARGIN_SECS) <= now
}

fn extract_access_token(payload: &Value) -> Option<String> {
    [
        payload.get("access_token"),
        payload.get("accessToken"),
        payload.get("token"),
        payload.get("data").and_then(|d| d.get("access_token")),
        payload.get("data").and_then(|d| d.get("accessToken")),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .map(strip_bearer)
    .find(|token| !token.is_empty())
}

/// Two-level token cache: a short-lived location token backed by the
/// agency-level access/refresh pair. Every failure here is fatal to the
/// caller's batch run.
async fn get_location_token(state: &Arc<AppState>, location_id: &str) -> Result<String, String> {
    let now = Utc::now();
    let cached = sqlx::query("SELECT accesstoken, expires_at FROM location_token WHERE locationid = $1")
        .bind(location_id)
        .fetch_optional(&state.db)
        .await
        .map_err(|err| format!("location token lookup failed: {err}"))?;
    if let Some(row) = cached {
        let token: String = row.get("accesstoken");
        let expires_at: DateTime<Utc> = row.get("expires_at");
        if location_token_valid(expires_at, now) && !token.trim().is_empty() {
            return Ok(strip_bearer(&token));
        }
    }

    let agency = sqlx::query(
        "SELECT access_token, refresh_token, expires_at FROM agency_token WHERE key = 'agency'",
    )
    .fetch_optional(&state.db)
    .await
    .map_err(|err| format!("agency token lookup failed: {err}"))?
    .ok_or_else(|| "agency token not found".to_string())?;

    let mut agency_token = strip_bearer(&agency.get::<String, _>("access_token"));
    let agency_expires: DateTime<Utc> = agency.get("expires_at");

    if agency_token_needs_refresh(agency_expires, now) {
        let refresh_token: String = agency.get("refresh_token");
        let response = state
            .http
            .post(format!("{}/oauth/token", state.config.ghl_api_url))
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", state.config.ghl_client_id.as_str()),
                ("client_secret", state.config.ghl_client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("user_type", "Company"),
                ("redirect_uri", state.config.ghl_redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|err| format!("agency token refresh failed: {err}"))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("agency token refresh rejected: {body}"));
        }
        let refreshed = response
            .json::<Value>()
            .await
            .map_err(|err| format!("agency token refresh parse failed: {err}"))?;
        let access_token = refreshed
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if access_token.is_empty() {
            return Err("agency token refresh response missing access_token".to_string());
        }
        let new_refresh = refreshed
            .get("refresh_token")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let expires_in = refreshed.get("expires_in").and_then(Value::as_i64).unwrap_or(86400);
        let new_expires = now + ChronoDuration::seconds(expires_in);
        sqlx::query(
            "UPDATE agency_token SET access_token = $1, refresh_token = $2, expires_at = $3 \
             WHERE key = 'agency'",
        )
        .bind(&access_token)
        .bind(&new_refresh)
        .bind(new_expires)
        .execute(&state.db)
        .await
        .map_err(|err| format!("agency token persist failed: {err}"))?;
        agency_token = strip_bearer(&access_token);
    }

    let response = state
        .http
        .post(format!("{}/oauth/locationToken", state.config.ghl_api_url))
        .bearer_auth(&agency_token)
        .header("Version", GHL_CONTACTS_VERSION)
        .json(&json!({
            "locationId": location_id,
            "companyId": state.config.ghl_company_id,
        }))
        .send()
        .await
        .map_err(|err| format!("location token mint failed: {err}"))?;
    let status = response.status();
    let payload = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
    if !status.is_success() {
        return Err(format!("location token mint rejected ({status}): {payload}"));
    }
    let token = extract_access_token(&payload)
        .ok_or_else(|| "location token response missing access_token".to_string())?;
    let expires_in = payload
        .get("expires_in")
        .and_then(Value::as_i64)
        .or_else(|| payload.get("expiresIn").and_then(Value::as_i64))
        .unwrap_or(86400);
    let expires_at = now + ChronoDuration::seconds(expires_in);
    sqlx::query(
        "INSERT INTO location_token (locationid, accesstoken, expires_at) VALUES ($1, $2, $3) \
         ON CONFLICT (locationid) DO UPDATE \
         SET accesstoken = EXCLUDED.accesstoken, expires_at = EXCLUDED.expires_at",
    )
    .bind(location_id)
    .bind(&token)
    .bind(expires_at)
    .execute(&state.db)
    .await
    .map_err(|err| format!("location token persist failed: {err}"))?;
    Ok(token)
}

// --- CRM messaging --------------------------------------------------------

fn normalize_history_messages(payload: &Value) -> Vec<Value> {
    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        return messages.clone();
    }
    if let Some(messages) = payload
        .get("messages")
        .and_then(|m| m.get("messages"))
        .and_then(Value::as_array)
    {
        return messages.clone();
    }
    vec![]
}

fn history_sort_key(message: &Value) -> i64 {
    let stamp = message
        .get("dateAdded")
        .or_else(|| message.get("createdAt"))
        .or_else(|| message.get("created_at"))
        .or_else(|| message.get("timestamp"))
        .or_else(|| message.get("date"));
    match stamp {
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|d| d.timestamp_millis())
            .unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

fn format_history(messages: &[Value]) -> String {
    let mut sorted = messages.to_vec();
    sorted.sort_by_key(history_sort_key);
    let start = sorted.len().saturating_sub(HISTORY_TAIL);
    sorted[start..]
        .iter()
        .map(|message| {
            let direction = message.get("direction").and_then(Value::as_str).unwrap_or("");
            let body = message
                .get("body")
                .or_else(|| message.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let speaker = if direction == "inbound" { "Usuário" } else { "Assistente" };
            format!("{speaker}: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn fetch_conversation_history(
    state: &Arc<AppState>,
    token: &str,
    conversation_id: &str,
) -> Value {
    let response = state
        .http
        .get(format!(
            "{}/conversations/{}/messages",
            state.config.ghl_api_url, conversation_id
        ))
        .bearer_auth(token)
        .header("Version", GHL_MESSAGES_VERSION)
        .send()
        .await;
    match response {
        Ok(res) if res.status().is_success() => res.json::<Value>().await.unwrap_or_else(|_| json!({})),
        Ok(res) => {
            tracing::warn!(status = %res.status(), "conversation history fetch rejected");
            json!({})
        }
        Err(err) => {
            tracing::warn!(error = %err, "conversation history fetch failed");
            json!({})
        }
    }
}

async fn send_conversation_message(
    state: &Arc<AppState>,
    token: &str,
    reply_type: &str,
    contact_id: &str,
    message: &str,
    conversation_provider_id: Option<&str>,
) -> Result<(), String> {
    let mut body = json!({
        "type": reply_type,
        "contactId": contact_id,
        "message": message,
    });
    if let Some(provider) = conversation_provider_id.filter(|p| !p.is_empty()) {
        body["conversationProviderId"] = json!(provider);
    }
    let response = state
        .http
        .post(format!("{}/conversations/messages", state.config.ghl_api_url))
        .bearer_auth(token)
        .header("Version", GHL_MESSAGES_VERSION)
        .json(&body)
        .send()
        .await
        .map_err(|err| format!("reply send failed: {err}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("reply send rejected ({status}): {body}"));
    }
    Ok(())
}

// --- Tool dispatcher ------------------------------------------------------

#[derive(Debug, Clone)]
struct ToolOutcome {
    ok: bool,
    status: Option<u16>,
    body: Value,
}

impl ToolOutcome {
    fn transport_error(err: impl std::fmt::Display) -> ToolOutcome {
        ToolOutcome {
            ok: false,
            status: None,
            body: json!({ "error": err.to_string() }),
        }
    }
}

async fn outcome_from_response(
    response: Result<reqwest::Response, reqwest::Error>,
) -> ToolOutcome {
    match response {
        Ok(res) => {
            let status = res.status().as_u16();
            let ok = res.status().is_success();
            let body = res.json::<Value>().await.unwrap_or_else(|_| json!({}));
            ToolOutcome {
                ok,
                status: Some(status),
                body,
            }
        }
        Err(err) => ToolOutcome::transport_error(err),
    }
}

fn tool_call_trace(name: &str, outcome: &ToolOutcome) -> Value {
    let mut entry = json!({
        "at": now_iso(),
        "source": "tool_call",
        "name": name,
        "ok": outcome.ok,
    });
    match outcome.status {
        Some(status) => entry["status"] = json!(status),
        None => {
            entry["error"] = outcome
                .body
                .get("error")
                .cloned()
                .unwrap_or_else(|| json!("request failed"));
        }
    }
    entry
}

async fn tool_get_contact(state: &Arc<AppState>, location_id: &str, contact_id: &str) -> ToolOutcome {
    let token = match get_location_token(state, location_id).await {
        Ok(token) => token,
        Err(err) => return ToolOutcome::transport_error(err),
    };
    let response = state
        .http
        .get(format!("{}/contacts/{}", state.config.ghl_api_url, contact_id))
        .bearer_auth(&token)
        .header("Version", GHL_CONTACTS_VERSION)
        .send()
        .await;
    outcome_from_response(response).await
}

async fn tool_get_conversation(
    state: &Arc<AppState>,
    location_id: &str,
    conversation_id: &str,
) -> ToolOutcome {
    let token = match get_location_token(state, location_id).await {
        Ok(token) => token,
        Err(err) => return ToolOutcome::transport_error(err),
    };
    let response = state
        .http
        .get(format!(
            "{}/conversations/{}",
            state.config.ghl_api_url, conversation_id
        ))
        .bearer_auth(&token)
        .header("Version", GHL_CONTACTS_VERSION)
        .send()
        .await;
    outcome_from_response(response).await
}

async fn tool_get_custom_fields(state: &Arc<AppState>, location_id: &str, model: &str) -> ToolOutcome {
    let token = match get_location_token(state, location_id).await {
        Ok(token) => token,
        Err(err) => return ToolOutcome::transport_error(err),
    };
    let response = state
        .http
        .get(format!(
            "{}/locations/{}/customFields",
            state.config.ghl_api_url, location_id
        ))
        .query(&[("model", model)])
        .bearer_auth(&token)
        .header("Version", GHL_CONTACTS_VERSION)
        .send()
        .await;
    outcome_from_response(response).await
}

/// Combined contact mutation: basic fields and custom fields, tag add and
/// remove, notes, workflow enrollment. Sections run independently and each
/// records its own result.
async fn tool_manage_contact(
    state: &Arc<AppState>,
    location_id: &str,
    contact_id: &str,
    args: &Value,
) -> ToolOutcome {
    let token = match get_location_token(state, location_id).await {
        Ok(token) => token,
        Err(err) => return ToolOutcome::transport_error(err),
    };
    let base = &state.config.ghl_api_url;
    let mut results = serde_json::Map::new();
    let mut ok = true;
    let mut last_status = None;

    if let Some(updates) = args.get("updates").filter(|u| u.is_object()) {
        let mut update_body = serde_json::Map::new();
        for key in [
            "firstName",
            "lastName",
            "name",
            "email",
            "phone",
            "businessName",
            "companyName",
            "company",
        ] {
            if let Some(value) = updates.get(key).and_then(Value::as_str) {
                if !value.is_empty() {
                    update_body.insert(key.to_string(), json!(value));
                }
            }
        }
        if let Some(fields) = updates.get("customFields").and_then(Value::as_array) {
            // The CRM's update payload names the value field `value`, while
            // the tool schema exposes `field_value`.
            let mapped = fields
                .iter()
                .filter_map(|cf| {
                    let id = cf.get("id").and_then(Value::as_str)?;
                    let value = cf.get("field_value").cloned().unwrap_or(Value::Null);
                    Some(json!({ "id": id, "value": value }))
                })
                .collect::<Vec<_>>();
            update_body.insert("customFields".to_string(), json!(mapped));
        }
        let outcome = outcome_from_response(
            state
                .http
                .put(format!("{base}/contacts/{contact_id}"))
                .bearer_auth(&token)
                .header("Version", GHL_CONTACTS_VERSION)
                .json(&Value::Object(update_body))
                .send()
                .await,
        )
        .await;
        ok &= outcome.ok;
        last_status = outcome.status.or(last_status);
        results.insert("updateContact".to_string(), outcome.body);
    }

    if let Some(tags) = args.get("tags").and_then(Value::as_array).filter(|t| !t.is_empty()) {
        let outcome = outcome_from_response(
            state
                .http
                .post(format!("{base}/contacts/{contact_id}/tags"))
                .bearer_auth(&token)
                .header("Version", GHL_CONTACTS_VERSION)
                .json(&json!({ "tags": tags }))
                .send()
                .await,
        )
        .await;
        ok &= outcome.ok;
        last_status = outcome.status.or(last_status);
        results.insert("addTags".to_string(), outcome.body);
    }

    if let Some(tags) = args
        .get("removeTags")
        .and_then(Value::as_array)
        .filter(|t| !t.is_empty())
    {
        let outcome = outcome_from_response(
            state
                .http
                .delete(format!("{base}/contacts/{contact_id}/tags"))
                .bearer_auth(&token)
                .header("Version", GHL_CONTACTS_VERSION)
                .json(&json!({ "tags": tags }))
                .send()
                .await,
        )
        .await;
        ok &= outcome.ok;
        last_status = outcome.status.or(last_status);
        results.insert("removeTags".to_string(), outcome.body);
    }

    if let Some(notes) = args.get("notes").and_then(Value::as_array).filter(|n| !n.is_empty()) {
        let mut note_results = Vec::new();
        for note in notes {
            let outcome = outcome_from_response(
                state
                    .http
                    .post(format!("{base}/contacts/{contact_id}/notes"))
                    .bearer_auth(&token)
                    .header("Version", GHL_CONTACTS_VERSION)
                    .json(&json!({ "body": note }))
                    .send()
                    .await,
            )
            .await;
            ok &= outcome.ok;
            last_status = outcome.status.or(last_status);
            note_results.push(outcome.body);
        }
        results.insert("notes".to_string(), json!(note_results));
    }

    if let Some(workflow_id) = args.get("workflowId").and_then(Value::as_str).filter(|w| !w.is_empty()) {
        let outcome = outcome_from_response(
            state
                .http
                .post(format!("{base}/contacts/{contact_id}/workflow/{workflow_id}"))
                .bearer_auth(&token)
                .header("Version", GHL_CONTACTS_VERSION)
                .send()
                .await,
        )
        .await;
        ok &= outcome.ok;
        last_status = outcome.status.or(last_status);
        results.insert("workflow".to_string(), outcome.body);
    }

    ToolOutcome {
        ok,
        status: last_status,
        body: Value::Object(results),
    }
}

async fn dispatch_tool(state: &Arc<AppState>, name: &str, args: &Value) -> ToolOutcome {
    let location_id = args.get("locationId").and_then(Value::as_str).unwrap_or("");
    match name {
        "ghl_get_custom_fields" => {
            let model = args.get("model").and_then(Value::as_str).unwrap_or("contact");
            tool_get_custom_fields(state, location_id, model).await
        }
        "ghl_manage_contact" => {
            let contact_id = args.get("contactId").and_then(Value::as_str).unwrap_or("");
            tool_manage_contact(state, location_id, contact_id, args).await
        }
        "ghl_get_conversation" => {
            let conversation_id = args
                .get("conversationId")
                .and_then(Value::as_str)
                .unwrap_or("");
            tool_get_conversation(state, location_id, conversation_id).await
        }
        "ghl_get_contact" => {
            let contact_id = args.get("contactId").and_then(Value::as_str).unwrap_or("");
            tool_get_contact(state, location_id, contact_id).await
        }
        _ => ToolOutcome {
            ok: false,
            status: None,
            body: json!({ "error": "Tool not implemented" }),
        },
    }
}

fn fill_missing(
    map: &mut serde_json::Map<String, Value>,
    key: &'static str,
    value: &str,
    filled: &mut Vec<&'static str>,
) {
    let missing = map
        .get(key)
        .and_then(Value::as_str)
        .map(str::is_empty)
        .unwrap_or(true);
    if missing {
        map.insert(key.to_string(), json!(value));
        filled.push(key);
    }
}

/// The model is never trusted to remember correct ids; anything it omitted
/// is filled from the job context before dispatch.
fn autofill_tool_args(name: &str, args: &mut Value, job: &InboundJob) -> Vec<&'static str> {
    let mut filled = Vec::new();
    if !args.is_object() {
        *args = json!({});
    }
    let Some(map) = args.as_object_mut() else {
        return filled;
    };
    match name {
        "ghl_manage_contact" | "ghl_get_contact" => {
            fill_missing(map, "locationId", &job.location_id, &mut filled);
            fill_missing(map, "contactId", &job.contact_id, &mut filled);
        }
        "ghl_get_custom_fields" => {
            fill_missing(map, "locationId", &job.location_id, &mut filled);
        }
        "ghl_get_conversation" => {
            fill_missing(map, "locationId", &job.location_id, &mut filled);
            fill_missing(map, "conversationId", &job.conversation_id, &mut filled);
        }
        _ => {}
    }
    filled
}

// --- Generation loop ------------------------------------------------------

fn gemini_tool_declarations() -> Value {
    json!([{
        "function_declarations": [
            {
                "name": "ghl_get_custom_fields",
                "description": "Busca a lista de campos personalizados (custom fields) disponíveis na GoHighLevel para contatos ou oportunidades. Se locationId não for informado, o backend preencherá automaticamente.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "locationId": { "type": "string", "description": "O ID da location na GHL" },
                        "model": { "type": "string", "enum": ["contact", "opportunity"], "description": "O modelo de dados para buscar os campos" }
                    },
                    "required": []
                }
            },
            {
                "name": "ghl_manage_contact",
                "description": "Ferramenta central para gerenciar contatos na GHL. Pode atualizar dados básicos, campos personalizados, adicionar/remover tags, criar notas e inserir em workflows, tudo em uma única chamada. Se locationId/contactId não forem informados, o backend preencherá automaticamente.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "locationId": { "type": "string" },
                        "contactId": { "type": "string" },
                        "updates": {
                            "type": "object",
                            "description": "Campos para atualizar (firstName, lastName, name, email, phone, businessName/companyName/company, customFields).",
                            "properties": {
                                "firstName": { "type": "string" },
                                "lastName": { "type": "string" },
                                "name": { "type": "string" },
                                "email": { "type": "string" },
                                "phone": { "type": "string" },
                                "businessName": { "type": "string" },
                                "companyName": { "type": "string" },
                                "company": { "type": "string" },
                                "customFields": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "properties": {
                                            "id": { "type": "string", "description": "O ID único do campo" },
                                            "field_value": { "type": "string", "description": "O valor a ser gravado" }
                                        },
                                        "required": ["id", "field_value"]
                                    }
                                }
                            }
                        },
                        "tags": { "type": "array", "items": { "type": "string" } },
                        "removeTags": { "type": "array", "items": { "type": "string" } },
                        "notes": { "type": "array", "items": { "type": "string" } },
                        "workflowId": { "type": "string" }
                    },
                    "required": []
                }
            },
            {
                "name": "ghl_get_conversation",
                "description": "Obtém os detalhes técnicos de uma conversa específica (status, participantes, etc). Se locationId/conversationId não forem informados, o backend preencherá automaticamente.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "locationId": { "type": "string" },
                        "conversationId": { "type": "string" }
                    },
                    "required": []
                }
            },
            {
                "name": "ghl_get_contact",
                "description": "Obtém os detalhes do contato na GoHighLevel (inclui campos e custom fields). Se locationId/contactId não forem informados, o backend preencherá automaticamente.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "locationId": { "type": "string" },
                        "contactId": { "type": "string" }
                    },
                    "required": []
                }
            }
        ]
    }])
}

async fn gemini_generate(
    state: &Arc<AppState>,
    contents: &[Value],
    system_instruction: &str,
) -> Result<Value, String> {
    let url = format!(
        "{}/v1beta/models/{}:generateContent?key={}",
        state.config.gemini_api_url, GEMINI_MODEL, state.config.gemini_api_key
    );
    let response = state
        .http
        .post(&url)
        .json(&json!({
            "contents": contents,
            "tools": gemini_tool_declarations(),
            "systemInstruction": { "parts": [{ "text": system_instruction }] },
        }))
        .send()
        .await
        .map_err(|err| format!("gemini request failed: {err}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("gemini returned {status}: {body}"));
    }
    response
        .json::<Value>()
        .await
        .map_err(|err| format!("gemini parse failed: {err}"))
}

/// Bounded function-calling loop. A tool failure is fed back to the model
/// as the function response; only transport-level generation failures
/// propagate and fail the batch.
async fn run_generation_loop(
    state: &Arc<AppState>,
    job: &InboundJob,
    mut contents: Vec<Value>,
    system_instruction: &str,
    trace: &mut Vec<Value>,
) -> Result<String, String> {
    for _ in 0..GENERATION_MAX_ROUNDS {
        let payload = gemini_generate(state, &contents, system_instruction).await?;
        let candidate = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .cloned()
            .unwrap_or(Value::Null);
        let part = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .cloned()
            .unwrap_or(Value::Null);

        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            contents.push(
                candidate
                    .get("content")
                    .cloned()
                    .unwrap_or_else(|| json!({ "role": "model", "parts": [part.clone()] })),
            );
            let mut args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            let autofilled = autofill_tool_args(&name, &mut args, job);
            trace.push(json!({
                "at": now_iso(),
                "source": "decision_trace",
                "step": "tool_autofill",
                "tool": name,
                "autofilled": autofilled,
            }));
            let outcome = dispatch_tool(state, &name, &args).await;
            trace.push(tool_call_trace(&name, &outcome));
            contents.push(json!({
                "role": "function",
                "parts": [{
                    "functionResponse": {
                        "name": name,
                        "response": { "content": outcome.body },
                    }
                }],
            }));
            continue;
        }

        let text = part.get("text").and_then(Value::as_str).unwrap_or("");
        trace.push(json!({
            "at": now_iso(),
            "source": "decision_trace",
            "step": "llm_text_response",
        }));
        if text.is_empty() {
            return Ok(REPLY_NO_ANSWER.to_string());
        }
        return Ok(text.to_string());
    }
    Ok(REPLY_GENERIC_FAILURE.to_string())
}

// --- Batch debounce, locking and execution --------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebounceWait {
    Ready,
    Superseded,
    BudgetExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollStep {
    Done(DebounceWait),
    Sleep(Duration),
}

/// One step of the debounce wait. A missing row reads as ready so a
/// transient read failure can never deadlock a locked batch.
fn schedule_poll_step(batch: Option<(&str, DateTime<Utc>)>, now: DateTime<Utc>) -> PollStep {
    let Some((status, scheduled_at)) = batch else {
        return PollStep::Done(DebounceWait::Ready);
    };
    if status != "pending" {
        return PollStep::Done(DebounceWait::Superseded);
    }
    let wait = scheduled_at - now;
    if wait <= ChronoDuration::zero() {
        return PollStep::Done(DebounceWait::Ready);
    }
    let millis = wait.num_milliseconds().clamp(0, SCHEDULE_POLL_CAP_MS) as u64;
    PollStep::Sleep(Duration::from_millis(millis))
}

async fn wait_for_batch_schedule(state: &Arc<AppState>, batch_id: &str) -> DebounceWait {
    for _ in 0..SCHEDULE_POLL_BUDGET {
        let row = sqlx::query("SELECT status, scheduled_at FROM conversation_batches WHERE id = $1")
            .bind(batch_id)
            .fetch_optional(&state.db)
            .await
            .ok()
            .flatten();
        let batch = row
            .as_ref()
            .map(|r| (r.get::<String, _>("status"), r.get::<DateTime<Utc>, _>("scheduled_at")));
        match schedule_poll_step(batch.as_ref().map(|(s, at)| (s.as_str(), *at)), Utc::now()) {
            PollStep::Done(result) => return result,
            PollStep::Sleep(duration) => tokio::time::sleep(duration).await,
        }
    }
    DebounceWait::BudgetExhausted
}

/// Atomic lock CAS: succeeds only when no live lock exists. Losing the race
/// is steady-state, not an error.
async fn acquire_batch_lock(state: &Arc<AppState>, batch_id: &str) -> bool {
    let now = Utc::now();
    let expiry = now - ChronoDuration::seconds(LOCK_STALE_AFTER_SECS);
    sqlx::query("SELECT id FROM acquire_batch_lock($1, $2, $3)")
        .bind(batch_id)
        .bind(now)
        .bind(expiry)
        .fetch_optional(&state.db)
        .await
        .map(|row| row.is_some())
        .unwrap_or(false)
}

async fn spawn_batch_runner(state: &Arc<AppState>, batch_id: String) {
    let task_state = state.clone();
    let mut tasks = state.batch_tasks.lock().await;
    // Reap already-finished runs so the registry only holds live tasks.
    while tasks.try_join_next().is_some() {}
    tasks.spawn(async move {
        let wait = wait_for_batch_schedule(&task_state, &batch_id).await;
        if wait == DebounceWait::Superseded {
            tracing::debug!(batch_id = %batch_id, "batch superseded before dispatch");
            return;
        }
        run_batch(task_state, batch_id).await;
    });
}

fn parse_agent_row(row: &PgRow) -> Agent {
    Agent {
        id: row.get("id"),
        location_id: row.get("location_id"),
        name: row.get("name"),
        personality: row.get("personality"),
        objective: row.get("objective"),
        is_active: row.get("is_active"),
    }
}

fn parse_inbound_job_row(row: &PgRow) -> InboundJob {
    InboundJob {
        id: row.get("id"),
        message_id: row.get("message_id"),
        agent_id: row.get("agent_id"),
        location_id: row.get("location_id"),
        contact_id: row.get("contact_id"),
        conversation_id: row.get("conversation_id"),
        batch_id: row.get("batch_id"),
        message_text: row.get("message_text"),
        knowledge_base_ids: row.get("knowledge_base_ids"),
        message_type: row.get("message_type"),
        conversation_provider_id: row.get("conversation_provider_id"),
    }
}

/// Skip is not an error: jobs end `skipped`, the batch ends `completed`.
async fn finish_skipped(state: &Arc<AppState>, batch_id: &str, trace_entry: Value) {
    let now = Utc::now();
    let _ = sqlx::query(
        "UPDATE inbound_jobs SET status = 'skipped', response_text = 'Disabled', \
         context_sources = $2, updated_at = $3 \
         WHERE batch_id = $1 AND status = 'processing'",
    )
    .bind(batch_id)
    .bind(Value::Array(vec![trace_entry]))
    .bind(now)
    .execute(&state.db)
    .await;
    let _ = sqlx::query(
        "UPDATE conversation_batches SET status = 'completed', locked_at = NULL WHERE id = $1",
    )
    .bind(batch_id)
    .execute(&state.db)
    .await;
}

async fn run_batch(state: Arc<AppState>, batch_id: String) {
    if let Err(err) = run_batch_inner(&state, &batch_id).await {
        tracing::error!(batch_id = %batch_id, error = %err, "batch run failed");
        let now = Utc::now();
        let _ = sqlx::query(
            "UPDATE inbound_jobs SET status = 'error', error_message = $2, updated_at = $3 \
             WHERE batch_id = $1 AND status = 'processing'",
        )
        .bind(&batch_id)
        .bind(&err)
        .bind(now)
        .execute(&state.db)
        .await;
        let _ = sqlx::query(
            "UPDATE conversation_batches SET status = 'error', locked_at = NULL WHERE id = $1",
        )
        .bind(&batch_id)
        .execute(&state.db)
        .await;
    }
}

async fn run_batch_inner(state: &Arc<AppState>, batch_id: &str) -> Result<(), String> {
    let job_rows = sqlx::query(
        "SELECT id, message_id, agent_id, location_id, contact_id, conversation_id, batch_id, \
                message_text, knowledge_base_ids, message_type, conversation_provider_id \
         FROM inbound_jobs WHERE batch_id = $1 AND status = 'pending' ORDER BY created_at ASC",
    )
    .bind(batch_id)
    .fetch_all(&state.db)
    .await
    .map_err(|err| format!("pending job load failed: {err}"))?;
    if job_rows.is_empty() {
        return Ok(());
    }
    let jobs = job_rows.iter().map(parse_inbound_job_row).collect::<Vec<_>>();
    let first = &jobs[0];

    sqlx::query(
        "UPDATE inbound_jobs SET status = 'processing', updated_at = $2 \
         WHERE batch_id = $1 AND status = 'pending'",
    )
    .bind(batch_id)
    .bind(Utc::now())
    .execute(&state.db)
    .await
    .map_err(|err| format!("job transition failed: {err}"))?;

    // The gates may have flipped while the batch debounced; re-check both.
    let agent_enabled: Option<bool> =
        sqlx::query_scalar("SELECT agent_enabled FROM conversations WHERE conversation_id = $1")
            .bind(&first.conversation_id)
            .fetch_optional(&state.db)
            .await
            .ok()
            .flatten();
    if agent_enabled != Some(true) {
        finish_skipped(
            state,
            batch_id,
            json!({
                "at": now_iso(),
                "source": "decision_trace",
                "step": "conversation_agent_disabled",
                "conversationId": first.conversation_id,
            }),
        )
        .await;
        return Ok(());
    }

    let agent_row = sqlx::query(
        "SELECT id, location_id, name, personality, objective, is_active FROM agents WHERE id = $1",
    )
    .bind(&first.agent_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let agent = agent_row.as_ref().map(parse_agent_row);
    let Some(agent) = agent.filter(|a| a.is_active) else {
        finish_skipped(
            state,
            batch_id,
            json!({
                "at": now_iso(),
                "source": "decision_trace",
                "step": "agent_inactive",
                "agentId": first.agent_id,
            }),
        )
        .await;
        return Ok(());
    };

    // Messages are combined in arrival order: one query, one reply.
    let texts = jobs
        .iter()
        .map(|job| job.message_text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let kb_ids = first.knowledge_base_ids.clone();
    let (kb_items, kb_mode) = retrieve_knowledge_items(state, &texts, &kb_ids).await;
    let context = format_knowledge_context(&kb_items);

    let token = get_location_token(state, &first.location_id).await?;
    let history_payload = fetch_conversation_history(state, &token, &first.conversation_id).await;
    let history = format_history(&normalize_history_messages(&history_payload));

    let system_instruction = render_system_prompt(&SystemPromptContext {
        personality: &agent.personality,
        objective: &agent.objective,
    });

    let mut trace: Vec<Value> = Vec::new();
    let wants_snapshot = keyword_wants_contact_snapshot(&texts);
    trace.push(json!({
        "at": now_iso(),
        "source": "kb_retrieval",
        "mode": kb_mode,
        "kb_ids_count": kb_ids.len(),
        "returned": kb_items.len(),
    }));
    trace.push(json!({
        "at": now_iso(),
        "source": "decision_trace",
        "step": "start_run_batch",
        "batchId": batch_id,
        "contactId": first.contact_id,
        "conversationId": first.conversation_id,
        "locationId": first.location_id,
        "flags": {
            "keywordWantsContactSnapshot": wants_snapshot,
            "isCompanyQuestion": is_company_question(&texts),
            "isAddressQuestion": is_address_question(&texts),
        },
    }));

    let mut contact_snapshot = String::new();
    let mut contact_company = String::new();
    let mut contact_prefetch_ok = false;
    let mut contact_address = ContactAddress::default();
    if wants_snapshot {
        let outcome = tool_get_contact(state, &first.location_id, &first.contact_id).await;
        contact_prefetch_ok = outcome.ok;
        contact_company = extract_company_name_from_contact_payload(&outcome.body);
        contact_address = extract_address_from_contact_payload(&outcome.body);
        trace.push(json!({
            "at": now_iso(),
            "source": "ghl_contact_prefetch",
            "ok": outcome.ok,
            "status": outcome.status,
            "company": if contact_company.is_empty() { Value::Null } else { json!(contact_company) },
            "note": if contact_company.is_empty() { "company_field_missing" } else { "company_field_found" },
            "address_fields_present": {
                "street": !contact_address.street.is_empty(),
                "address2": !contact_address.address2.is_empty(),
                "city": !contact_address.city.is_empty(),
                "state": !contact_address.state.is_empty(),
                "postalCode": !contact_address.postal_code.is_empty(),
                "country": !contact_address.country.is_empty(),
            },
        }));
        if outcome.ok {
            contact_snapshot = format!(
                "\n\n[Dados do contato (sistema) - não mencionar ao usuário]\n{}",
                to_short_json(&outcome.body, CONTACT_SNAPSHOT_MAX)
            );
        }
    }

    let technical_context = format!(
        "\n\n[Dados técnicos - não mencionar ao usuário]\nlocationId={}\nconversationId={}\ncontactId={}\nmessageType={}\nconversationProviderId={}",
        first.location_id,
        first.conversation_id,
        first.contact_id,
        first.message_type.as_deref().unwrap_or(""),
        first.conversation_provider_id.as_deref().unwrap_or(""),
    );
    let derived_context = if contact_company.is_empty() {
        String::new()
    } else {
        format!("\n\n[Derivado - não mencionar ao usuário]\nempresa_cadastrada={contact_company}")
    };
    let user_content = format!(
        "Histórico:\n{history}\n\nContexto:\n{context}\n\nMensagens:\n{texts}{technical_context}{derived_context}{contact_snapshot}"
    );
    let contents = vec![json!({ "role": "user", "parts": [{ "text": user_content }] })];

    let mut final_reply;
    if wants_snapshot && !contact_prefetch_ok && !is_company_correction(&texts) {
        trace.push(json!({
            "at": now_iso(),
            "source": "decision_trace",
            "step": "prefetch_required_but_failed",
            "ok": false,
        }));
        final_reply = REPLY_SNAPSHOT_UNAVAILABLE.to_string();
    } else {
        match classify_intent(&texts) {
            Some(MessageIntent::CompanyUpdate) => {
                let target = extract_company_from_update_request(&texts);
                trace.push(json!({
                    "at": now_iso(),
                    "source": "decision_trace",
                    "step": "company_update_request_detected",
                    "targetCompany": if target.is_empty() { Value::Null } else { json!(target) },
                }));
                if target.is_empty() {
                    final_reply = REPLY_COMPANY_UPDATE_ASK_NAME.to_string();
                } else {
                    let args = json!({
                        "locationId": first.location_id,
                        "contactId": first.contact_id,
                        "updates": { "companyName": target },
                    });
                    let outcome = dispatch_tool(state, "ghl_manage_contact", &args).await;
                    trace.push(tool_call_trace("ghl_manage_contact", &outcome));
                    final_reply = if outcome.ok {
                        format!("Pronto — atualizei a empresa no seu cadastro para: *{target}*.")
                    } else {
                        REPLY_COMPANY_UPDATE_FAILED.to_string()
                    };
                }
            }
            Some(MessageIntent::CompanyCorrection) => {
                let corrected = extract_company_from_user_correction(&texts);
                trace.push(json!({
                    "at": now_iso(),
                    "source": "decision_trace",
                    "step": "company_correction_detected",
                    "corrected": if corrected.is_empty() { Value::Null } else { json!(corrected) },
                }));
                final_reply = if corrected.is_empty() {
                    REPLY_CORRECTION_ASK_NAME.to_string()
                } else {
                    format!(
                        "Perfeito — entendi. A empresa correta é *{corrected}*.\n\nQuer que eu atualize a empresa cadastrada no seu cadastro para *{corrected}*?"
                    )
                };
            }
            Some(MessageIntent::CompanyQuestion) => {
                if contact_company.is_empty() {
                    trace.push(json!({
                        "at": now_iso(),
                        "source": "decision_trace",
                        "step": "answer_company_deterministic",
                        "ok": false,
                        "reason": "company_field_missing_or_prefetch_failed",
                    }));
                    final_reply = REPLY_COMPANY_UNAVAILABLE.to_string();
                } else {
                    trace.push(json!({
                        "at": now_iso(),
                        "source": "decision_trace",
                        "step": "answer_company_deterministic",
                        "ok": true,
                    }));
                    final_reply = format!(
                        "A empresa cadastrada no seu cadastro é: *{contact_company}*.\n\nSe quiser, posso atualizar para a empresa correta — me diga o nome exato."
                    );
                }
            }
            Some(MessageIntent::AddressQuestion) => {
                if !contact_prefetch_ok {
                    trace.push(json!({
                        "at": now_iso(),
                        "source": "decision_trace",
                        "step": "answer_address_deterministic",
                        "ok": false,
                        "reason": "prefetch_failed",
                    }));
                    final_reply = REPLY_ADDRESS_UNAVAILABLE.to_string();
                } else if !contact_address.has_any() {
                    trace.push(json!({
                        "at": now_iso(),
                        "source": "decision_trace",
                        "step": "answer_address_deterministic",
                        "ok": false,
                    }));
                    final_reply = REPLY_ADDRESS_EMPTY.to_string();
                } else {
                    trace.push(json!({
                        "at": now_iso(),
                        "source": "decision_trace",
                        "step": "answer_address_deterministic",
                        "ok": true,
                    }));
                    final_reply = compose_address_reply(&contact_address);
                }
            }
            None => {
                final_reply =
                    run_generation_loop(state, first, contents, &system_instruction, &mut trace)
                        .await?;
            }
        }
    }

    // Every reply path goes through the internal-id scrub before sending.
    if should_block_internal_id_request(&final_reply) {
        final_reply = REPLY_SAFE_BLOCKED.to_string();
        trace.push(json!({
            "at": now_iso(),
            "source": "decision_trace",
            "step": "blocked_internal_id_request",
            "ok": true,
        }));
    }

    let meta_row = sqlx::query(
        "SELECT raw_payload, message_type, conversation_provider_id \
         FROM inbound_messages WHERE message_id = $1 LIMIT 1",
    )
    .bind(&first.message_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let meta_type = meta_row
        .as_ref()
        .and_then(|row| row.get::<Option<String>, _>("message_type"));
    let meta_provider = meta_row
        .as_ref()
        .and_then(|row| row.get::<Option<String>, _>("conversation_provider_id"));
    let raw_payload = meta_row
        .as_ref()
        .map(|row| row.get::<Value, _>("raw_payload"))
        .unwrap_or(Value::Null);
    let (inferred_type, inferred_provider) =
        infer_reply_channel(first, meta_type, meta_provider, &raw_payload);
    let reply_type = map_message_type_to_ghl(&inferred_type, inferred_provider.as_deref());

    // Fire-and-forget: a rejected send is traced and logged, not retried;
    // the batch still completes with its conversational result.
    if let Err(err) = send_conversation_message(
        state,
        &token,
        &reply_type,
        &first.contact_id,
        &final_reply,
        inferred_provider.as_deref(),
    )
    .await
    {
        trace.push(json!({
            "at": now_iso(),
            "source": "decision_trace",
            "step": "reply_send_failed",
            "error": err,
        }));
        tracing::warn!(batch_id = %batch_id, "reply send failed");
    }

    let now = Utc::now();
    sqlx::query(
        "UPDATE inbound_jobs SET status = 'completed', response_text = $2, context_sources = $3, \
         updated_at = $4 WHERE batch_id = $1 AND status = 'processing'",
    )
    .bind(batch_id)
    .bind(&final_reply)
    .bind(Value::Array(trace))
    .bind(now)
    .execute(&state.db)
    .await
    .map_err(|err| format!("job completion failed: {err}"))?;
    sqlx::query(
        "UPDATE conversation_batches SET status = 'completed', locked_at = NULL WHERE id = $1",
    )
    .bind(batch_id)
    .execute(&state.db)
    .await
    .map_err(|err| format!("batch completion failed: {err}"))?;
    Ok(())
}

// --- HTTP surface ---------------------------------------------------------

async fn inbound_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.config.webhook_secret.as_deref() {
        let signature = headers.get("x-wh-signature").and_then(|v| v.to_str().ok());
        if !verify_webhook_signature(secret, signature, &body) {
            return (StatusCode::UNAUTHORIZED, "Invalid signature".to_string()).into_response();
        }
    }

    let raw = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let payload = unwrap_webhook_payload(&raw);
    let message = WebhookMessage::from_value(&payload);

    if let Some(direction) = message.direction.as_deref() {
        if !direction.eq_ignore_ascii_case("inbound") {
            return (StatusCode::OK, "Ignored".to_string()).into_response();
        }
    }
    if let Some(message_type) = message.message_type.as_deref() {
        if message_type.eq_ignore_ascii_case("CALL") {
            return (StatusCode::OK, "Ignored".to_string()).into_response();
        }
    }

    let Some(conversation_id) = message.conversation_id.clone().filter(|v| !v.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Bad Request".to_string()).into_response();
    };
    let Some(location_id) = message.location_id.clone().filter(|v| !v.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Bad Request".to_string()).into_response();
    };
    let Some(contact_id) = message.contact_id.clone().filter(|v| !v.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Bad Request".to_string()).into_response();
    };
    let message_id = resolve_message_id(&message);

    match sqlx::query_scalar::<_, String>("SELECT id FROM inbound_messages WHERE message_id = $1")
        .bind(&message_id)
        .fetch_optional(&state.db)
        .await
    {
        Ok(Some(_)) => return (StatusCode::OK, "Duplicate".to_string()).into_response(),
        Ok(None) => {}
        Err(err) => return internal_error(err),
    }

    match sqlx::query_scalar::<_, bool>(
        "SELECT agent_enabled FROM conversations WHERE conversation_id = $1",
    )
    .bind(&conversation_id)
    .fetch_optional(&state.db)
    .await
    {
        Ok(Some(true)) => {}
        Ok(_) => return (StatusCode::OK, "Disabled".to_string()).into_response(),
        Err(err) => return internal_error(err),
    }

    let internal_location_id = match sqlx::query_scalar::<_, String>(
        "SELECT id FROM locations WHERE ghl_location_id = $1",
    )
    .bind(&location_id)
    .fetch_optional(&state.db)
    .await
    {
        Ok(Some(id)) => id,
        Ok(None) => return (StatusCode::OK, "Disabled".to_string()).into_response(),
        Err(err) => return internal_error(err),
    };

    let agent = match sqlx::query(
        "SELECT id, location_id, name, personality, objective, is_active FROM agents \
         WHERE location_id = $1 AND is_active = true ORDER BY created_at DESC LIMIT 1",
    )
    .bind(&internal_location_id)
    .fetch_optional(&state.db)
    .await
    {
        Ok(Some(row)) => parse_agent_row(&row),
        Ok(None) => return (StatusCode::OK, "Disabled".to_string()).into_response(),
        Err(err) => return internal_error(err),
    };

    let kb_ids = sqlx::query_scalar::<_, String>(
        "SELECT knowledge_base_id FROM agent_knowledge_bases WHERE agent_id = $1",
    )
    .bind(&agent.id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    // The unique index is the real idempotency barrier; a raced duplicate
    // shows up as zero inserted rows.
    let inserted = sqlx::query(
        "INSERT INTO inbound_messages (id, message_id, location_id, contact_id, conversation_id, \
         body, raw_payload, agent_id, message_type, conversation_provider_id, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (message_id) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&message_id)
    .bind(&location_id)
    .bind(&contact_id)
    .bind(&conversation_id)
    .bind(message.body_text())
    .bind(&payload)
    .bind(&agent.id)
    .bind(&message.message_type)
    .bind(&message.conversation_provider_id)
    .bind(Utc::now())
    .execute(&state.db)
    .await;
    match inserted {
        Ok(result) if result.rows_affected() == 0 => {
            return (StatusCode::OK, "Duplicate".to_string()).into_response()
        }
        Ok(_) => {}
        Err(err) => return internal_error(err),
    }

    let now = Utc::now();
    let scheduled_at = now + ChronoDuration::seconds(BATCH_DEBOUNCE_SECS);
    let batch_id = match sqlx::query_scalar::<_, String>(
        "SELECT id FROM conversation_batches \
         WHERE conversation_id = $1 AND status = 'pending' \
         ORDER BY scheduled_at DESC LIMIT 1",
    )
    .bind(&conversation_id)
    .fetch_optional(&state.db)
    .await
    {
        Ok(Some(id)) => {
            // Another message in the burst: push the dispatch time out.
            if let Err(err) =
                sqlx::query("UPDATE conversation_batches SET scheduled_at = $2 WHERE id = $1")
                    .bind(&id)
                    .bind(scheduled_at)
                    .execute(&state.db)
                    .await
            {
                return internal_error(err);
            }
            id
        }
        Ok(None) => {
            let id = Uuid::new_v4().to_string();
            if let Err(err) = sqlx::query(
                "INSERT INTO conversation_batches (id, conversation_id, status, scheduled_at, created_at) \
                 VALUES ($1, $2, 'pending', $3, $4)",
            )
            .bind(&id)
            .bind(&conversation_id)
            .bind(scheduled_at)
            .bind(now)
            .execute(&state.db)
            .await
            {
                return internal_error(err);
            }
            id
        }
        Err(err) => return internal_error(err),
    };

    if let Err(err) = sqlx::query(
        "INSERT INTO inbound_jobs (id, message_id, agent_id, location_id, contact_id, \
         conversation_id, batch_id, status, message_text, scheduled_at, knowledge_base_ids, \
         message_type, conversation_provider_id, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, $10, $11, $12, $13, $13)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&message_id)
    .bind(&agent.id)
    .bind(&location_id)
    .bind(&contact_id)
    .bind(&conversation_id)
    .bind(&batch_id)
    .bind(message.body_text())
    .bind(scheduled_at)
    .bind(&kb_ids)
    .bind(&message.message_type)
    .bind(&message.conversation_provider_id)
    .bind(now)
    .execute(&state.db)
    .await
    {
        return internal_error(err);
    }

    if acquire_batch_lock(&state, &batch_id).await {
        spawn_batch_runner(&state, batch_id.clone()).await;
    }

    (StatusCode::OK, Json(json!({ "success": true, "batchId": batch_id }))).into_response()
}

/// Manual drain for operators: run the requested batch (or the oldest
/// pending one) right now, still behind the lock CAS.
async fn process_pending(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = serde_json::from_slice::<ProcessRequestBody>(&body).unwrap_or_default();
    let target = match request.batch_id.filter(|v| !v.is_empty()) {
        Some(id) => Some(id),
        None => sqlx::query_scalar::<_, String>(
            "SELECT id FROM conversation_batches WHERE status = 'pending' \
             ORDER BY scheduled_at ASC LIMIT 1",
        )
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten(),
    };
    let Some(batch_id) = target else {
        return (StatusCode::OK, Json(json!({ "message": "No pending batches" }))).into_response();
    };
    if !acquire_batch_lock(&state, &batch_id).await {
        return (
            StatusCode::OK,
            Json(json!({ "success": false, "batchId": batch_id, "message": "Batch is locked" })),
        )
            .into_response();
    }
    run_batch(state.clone(), batch_id.clone()).await;
    (StatusCode::OK, Json(json!({ "success": true, "batchId": batch_id }))).into_response()
}

async fn list_inbound_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let conversation_id = query.conversation_id.unwrap_or_default();
    let batch_id = query.batch_id.unwrap_or_default();
    let status = query.status.unwrap_or_default();
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let rows = match sqlx::query(
        "SELECT id, message_id, agent_id, batch_id, conversation_id, status, message_text, \
                response_text, context_sources, error_message, created_at, updated_at \
         FROM inbound_jobs \
         WHERE ($1 = '' OR conversation_id = $1) \
           AND ($2 = '' OR batch_id = $2) \
           AND ($3 = '' OR status = $3) \
         ORDER BY created_at DESC LIMIT $4",
    )
    .bind(&conversation_id)
    .bind(&batch_id)
    .bind(&status)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    {
        Ok(rows) => rows,
        Err(err) => return internal_error(err),
    };
    let jobs = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.get::<String, _>("id"),
                "messageId": row.get::<String, _>("message_id"),
                "agentId": row.get::<String, _>("agent_id"),
                "batchId": row.get::<String, _>("batch_id"),
                "conversationId": row.get::<String, _>("conversation_id"),
                "status": row.get::<String, _>("status"),
                "messageText": row.get::<String, _>("message_text"),
                "responseText": row.get::<Option<String>, _>("response_text"),
                "contextSources": row.get::<Option<Value>, _>("context_sources"),
                "errorMessage": row.get::<Option<String>, _>("error_message"),
                "createdAt": row.get::<DateTime<Utc>, _>("created_at").to_rfc3339(),
                "updatedAt": row.get::<DateTime<Utc>, _>("updated_at").to_rfc3339(),
            })
        })
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "jobs": jobs }))).into_response()
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agent_server=info,sqlx=warn")),
        )
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    let port = config.port;

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let state = Arc::new(AppState {
        db,
        http: reqwest::Client::new(),
        config,
        batch_tasks: Mutex::new(JoinSet::new()),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhooks/inbound", post(inbound_webhook))
        .route("/api/inbound/process", post(process_pending))
        .route("/api/inbound/jobs", get(list_inbound_jobs))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(%addr, "agent server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server runtime failure");

    // Drain in-flight batch runs so no batch is left locked mid-flight.
    let mut tasks = state.batch_tasks.lock().await;
    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_array_wrapped_envelope() {
        let raw = json!([{ "body": { "messageId": "m1", "conversationId": "c1" } }]);
        let payload = unwrap_webhook_payload(&raw);
        assert_eq!(payload["messageId"], "m1");

        let raw = json!([{ "messageId": "m2" }]);
        let payload = unwrap_webhook_payload(&raw);
        assert_eq!(payload["messageId"], "m2");
    }

    #[test]
    fn unwraps_object_wrapped_envelope_only_when_body_looks_like_message() {
        let raw = json!({ "body": { "type": "SMS", "messageId": "m3" } });
        let payload = unwrap_webhook_payload(&raw);
        assert_eq!(payload["messageId"], "m3");

        // A plain text body is the message's own field, not an envelope.
        let raw = json!({ "messageId": "m4", "body": "oi" });
        let payload = unwrap_webhook_payload(&raw);
        assert_eq!(payload["messageId"], "m4");
        assert_eq!(payload["body"], "oi");
    }

    #[test]
    fn bare_payload_passes_through() {
        let raw = json!({ "messageId": "m5", "direction": "inbound" });
        assert_eq!(unwrap_webhook_payload(&raw), raw);
    }

    #[test]
    fn message_id_falls_back_through_webhook_id_and_synthesized_key() {
        let msg = WebhookMessage::from_value(&json!({ "messageId": "m1", "webhookId": "w1" }));
        assert_eq!(resolve_message_id(&msg), "m1");

        let msg = WebhookMessage::from_value(&json!({ "webhookId": "w1" }));
        assert_eq!(resolve_message_id(&msg), "w1");

        let msg = WebhookMessage::from_value(&json!({
            "conversationId": "c1",
            "dateAdded": "2024-05-01T10:00:00Z"
        }));
        assert_eq!(resolve_message_id(&msg), "c1:2024-05-01T10:00:00Z");

        let msg = WebhookMessage::from_value(&json!({
            "conversation_id": "c2",
            "timestamp": 1714557600000i64
        }));
        assert_eq!(resolve_message_id(&msg), "c2:1714557600000");
    }

    #[test]
    fn company_question_is_classified_deterministically() {
        let intent = classify_intent("qual é a empresa cadastrada no meu cadastro?");
        assert_eq!(intent, Some(MessageIntent::CompanyQuestion));
    }

    #[test]
    fn company_update_takes_precedence_over_question() {
        let intent = classify_intent("troca a empresa para Beta Comercio");
        assert_eq!(intent, Some(MessageIntent::CompanyUpdate));
        assert_eq!(
            extract_company_from_update_request("troca a empresa para Beta Comercio"),
            "Beta Comercio"
        );
        assert_eq!(
            extract_company_from_update_request("pode alterar a empresa pra Acme Ltda?"),
            "Acme Ltda"
        );
        assert_eq!(extract_company_from_update_request("muda a empresa"), "");
    }

    #[test]
    fn company_correction_extracts_trailing_name() {
        let text = "a empresa não é Acme, é Beta Ltda";
        assert_eq!(classify_intent(text), Some(MessageIntent::CompanyCorrection));
        assert_eq!(extract_company_from_user_correction(text), "Beta Ltda");
        assert_eq!(extract_company_from_user_correction("tudo certo"), "");
    }

    #[test]
    fn address_question_is_last_in_the_chain() {
        assert_eq!(
            classify_intent("qual o endereço no meu cadastro?"),
            Some(MessageIntent::AddressQuestion)
        );
        assert_eq!(classify_intent("bom dia, tudo bem?"), None);
    }

    #[test]
    fn internal_id_requests_are_blocked() {
        assert!(should_block_internal_id_request("me passa o id do contato"));
        assert!(should_block_internal_id_request("qual o código do meu contato?"));
        assert!(should_block_internal_id_request("what is my contact id?"));
        assert!(should_block_internal_id_request("contactId: abc123"));
        assert!(!should_block_internal_id_request("qual a empresa cadastrada?"));
    }

    #[test]
    fn company_question_wins_but_reply_is_still_scrubbed() {
        // The intent chain answers the company question; the final-reply
        // scrub still fires if an id phrase leaks into the answer.
        let text = "qual é a empresa cadastrada? e o contact id?";
        assert_eq!(classify_intent(text), Some(MessageIntent::CompanyQuestion));
        let leaked_reply = "A empresa é Acme. Seu contact id é X.";
        assert!(should_block_internal_id_request(leaked_reply));
    }

    #[test]
    fn snapshot_keywords_cover_company_and_address_questions() {
        assert!(keyword_wants_contact_snapshot("qual é a empresa cadastrada no meu cadastro?"));
        assert!(keyword_wants_contact_snapshot("qual o endereço?"));
        assert!(keyword_wants_contact_snapshot("como anda o processo?"));
        assert!(!keyword_wants_contact_snapshot("bom dia!"));
    }

    #[test]
    fn maps_message_types_to_crm_enum() {
        assert_eq!(map_message_type_to_ghl("TYPE_SMS", None), "SMS");
        assert_eq!(map_message_type_to_ghl("TYPE_WHATSAPP", None), "WhatsApp");
        assert_eq!(map_message_type_to_ghl("TYPE_WEBCHAT", None), "Live_Chat");
        assert_eq!(map_message_type_to_ghl("TYPE_GMB", None), "Custom");
        assert_eq!(map_message_type_to_ghl("IG", None), "IG");
        // Unknown types pass through untouched.
        assert_eq!(map_message_type_to_ghl("TYPE_NEW", None), "TYPE_NEW");
        // A conversation provider forces SMS regardless of the type.
        assert_eq!(map_message_type_to_ghl("TYPE_WHATSAPP", Some("prov1")), "SMS");
        assert_eq!(map_message_type_to_ghl("TYPE_WHATSAPP", Some("")), "WhatsApp");
    }

    fn job_fixture() -> InboundJob {
        InboundJob {
            id: "j1".to_string(),
            message_id: "m1".to_string(),
            agent_id: "a1".to_string(),
            location_id: "loc1".to_string(),
            contact_id: "ct1".to_string(),
            conversation_id: "c1".to_string(),
            batch_id: "b1".to_string(),
            message_text: "oi".to_string(),
            knowledge_base_ids: vec![],
            message_type: None,
            conversation_provider_id: None,
        }
    }

    #[test]
    fn reply_channel_prefers_job_then_stored_metadata_then_payload() {
        let mut job = job_fixture();
        job.message_type = Some("TYPE_SMS".to_string());
        let (message_type, provider) =
            infer_reply_channel(&job, Some("Email".to_string()), None, &Value::Null);
        assert_eq!(message_type, "TYPE_SMS");
        assert_eq!(provider, None);

        let job = job_fixture();
        let (message_type, _) =
            infer_reply_channel(&job, Some("Email".to_string()), None, &Value::Null);
        assert_eq!(message_type, "Email");

        let job = job_fixture();
        let payload = json!({ "messageType": "TYPE_FACEBOOK", "conversationProviderId": "p9" });
        let (message_type, provider) = infer_reply_channel(&job, None, None, &payload);
        assert_eq!(message_type, "TYPE_FACEBOOK");
        assert_eq!(provider.as_deref(), Some("p9"));

        let job = job_fixture();
        let (message_type, _) = infer_reply_channel(&job, None, None, &Value::Null);
        assert_eq!(message_type, "WhatsApp");
    }

    fn item(content: &str, content_type: &str, title: Option<&str>, url: Option<&str>) -> KnowledgeItem {
        KnowledgeItem {
            content: content.to_string(),
            content_type: content_type.to_string(),
            title: title.map(str::to_string),
            url: url.map(str::to_string),
        }
    }

    #[test]
    fn knowledge_context_renders_faq_and_reference_urls() {
        let items = vec![
            item("Atendemos de 9h às 18h.", "faq", Some("Qual o horário?"), None),
            item("Planos a partir de R$99.", "chunk", None, Some("https://ex.com/planos")),
            item("Texto solto.", "chunk", None, None),
        ];
        let context = format_knowledge_context(&items);
        assert!(context.contains("Q: Qual o horário?\nA: Atendemos de 9h às 18h."));
        assert!(context.contains("Planos a partir de R$99.\n\nURL de referência: https://ex.com/planos"));
        assert!(context.contains("Texto solto."));
        assert_eq!(context.matches("\n\n---\n\n").count(), 2);
    }

    #[test]
    fn knowledge_context_caps_items_folded_into_the_prompt() {
        let items = (0..8)
            .map(|i| item(&format!("chunk {i}"), "chunk", None, None))
            .collect::<Vec<_>>();
        let context = format_knowledge_context(&items);
        assert!(context.contains("chunk 4"));
        assert!(!context.contains("chunk 5"));
    }

    #[test]
    fn faq_without_title_falls_back_to_content_as_question() {
        let items = vec![item("Resposta direta.", "faq", None, None)];
        let context = format_knowledge_context(&items);
        assert_eq!(context, "Q: Resposta direta.\nA: Resposta direta.");
    }

    #[test]
    fn history_is_sorted_ascending_tagged_and_tail_limited() {
        let mut messages = Vec::new();
        for i in 0..12 {
            messages.push(json!({
                "direction": if i % 2 == 0 { "inbound" } else { "outbound" },
                "body": format!("msg {i}"),
                "dateAdded": format!("2024-05-01T10:{:02}:00Z", i),
            }));
        }
        // Shuffle one element out of order to prove sorting happens.
        messages.swap(0, 11);
        let history = format_history(&messages);
        let lines = history.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), HISTORY_TAIL);
        assert_eq!(lines[0], "Usuário: msg 2");
        assert_eq!(lines[9], "Assistente: msg 11");
    }

    #[test]
    fn history_payload_nesting_variants_are_normalized() {
        let flat = json!({ "messages": [{ "body": "a" }] });
        assert_eq!(normalize_history_messages(&flat).len(), 1);
        let nested = json!({ "messages": { "messages": [{ "body": "a" }, { "body": "b" }] } });
        assert_eq!(normalize_history_messages(&nested).len(), 2);
        assert!(normalize_history_messages(&json!({})).is_empty());
    }

    #[test]
    fn poll_step_tri_state() {
        let now = Utc::now();
        // Due: run now.
        let step = schedule_poll_step(Some(("pending", now - ChronoDuration::seconds(1))), now);
        assert_eq!(step, PollStep::Done(DebounceWait::Ready));
        // Someone else finished the batch.
        let step = schedule_poll_step(Some(("completed", now + ChronoDuration::seconds(30))), now);
        assert_eq!(step, PollStep::Done(DebounceWait::Superseded));
        // Not due yet: sleep is capped.
        let step = schedule_poll_step(Some(("pending", now + ChronoDuration::seconds(30))), now);
        assert_eq!(step, PollStep::Sleep(Duration::from_millis(SCHEDULE_POLL_CAP_MS as u64)));
        let step = schedule_poll_step(Some(("pending", now + ChronoDuration::milliseconds(500))), now);
        assert_eq!(step, PollStep::Sleep(Duration::from_millis(500)));
        // Unreadable row must not deadlock the locked batch.
        assert_eq!(schedule_poll_step(None, now), PollStep::Done(DebounceWait::Ready));
    }

    #[test]
    fn token_expiry_decisions() {
        let now = Utc::now();
        assert!(location_token_valid(now + ChronoDuration::seconds(60), now));
        assert!(!location_token_valid(now - ChronoDuration::seconds(1), now));
        assert!(!location_token_valid(now, now));

        // Refresh kicks in inside the safety margin, not only after expiry.
        assert!(agency_token_needs_refresh(now + ChronoDuration::seconds(119), now));
        assert!(agency_token_needs_refresh(now - ChronoDuration::seconds(10), now));
        assert!(!agency_token_needs_refresh(now + ChronoDuration::seconds(121), now));
    }

    #[test]
    fn tool_args_autofill_only_missing_ids() {
        let job = job_fixture();
        let mut args = json!({ "locationId": "other-loc" });
        let filled = autofill_tool_args("ghl_manage_contact", &mut args, &job);
        assert_eq!(filled, vec!["contactId"]);
        assert_eq!(args["locationId"], "other-loc");
        assert_eq!(args["contactId"], "ct1");

        let mut args = json!({});
        let filled = autofill_tool_args("ghl_get_conversation", &mut args, &job);
        assert_eq!(filled, vec!["locationId", "conversationId"]);
        assert_eq!(args["conversationId"], "c1");

        let mut args = Value::Null;
        let filled = autofill_tool_args("ghl_get_custom_fields", &mut args, &job);
        assert_eq!(filled, vec!["locationId"]);
        assert_eq!(args["locationId"], "loc1");
    }

    #[test]
    fn address_reply_lists_present_and_missing_fields() {
        let address = ContactAddress {
            street: "Rua das Flores, 100".to_string(),
            city: "Campinas".to_string(),
            ..ContactAddress::default()
        };
        let reply = compose_address_reply(&address);
        assert!(reply.contains("- *Rua*: Rua das Flores, 100"));
        assert!(reply.contains("- *Cidade*: Campinas"));
        assert!(reply.contains("Ainda não tenho: Estado, CEP, País."));

        let full = ContactAddress {
            street: "Rua A".to_string(),
            address2: "Sala 2".to_string(),
            city: "SP".to_string(),
            state: "SP".to_string(),
            postal_code: "01000-000".to_string(),
            country: "Brasil".to_string(),
        };
        assert!(!compose_address_reply(&full).contains("Ainda não tenho"));
    }

    #[test]
    fn contact_payload_extraction_tolerates_nesting_and_aliases() {
        let payload = json!({ "contact": { "companyName": " Acme Ltda " } });
        assert_eq!(extract_company_name_from_contact_payload(&payload), "Acme Ltda");
        let payload = json!({ "data": { "business_name": "Beta" } });
        assert_eq!(extract_company_name_from_contact_payload(&payload), "Beta");
        let payload = json!({ "company": "Gama" });
        assert_eq!(extract_company_name_from_contact_payload(&payload), "Gama");
        assert_eq!(extract_company_name_from_contact_payload(&json!({})), "");

        let payload = json!({ "contact": {
            "address1": "Rua B",
            "address_2": "Fundos",
            "zip": "13000-000",
            "city": "Campinas"
        }});
        let address = extract_address_from_contact_payload(&payload);
        assert_eq!(address.street, "Rua B");
        assert_eq!(address.address2, "Fundos");
        assert_eq!(address.postal_code, "13000-000");
        assert_eq!(address.city, "Campinas");
        assert_eq!(address.state, "");
    }

    #[test]
    fn short_json_truncates_on_char_boundaries() {
        let value = json!({ "nome": "ação".repeat(20) });
        let full = to_short_json(&value, 10_000);
        assert!(full.starts_with('{'));
        let clipped = to_short_json(&value, 16);
        assert!(clipped.ends_with("...(truncated)"));
    }

    #[test]
    fn bearer_prefix_is_stripped_case_insensitively() {
        assert_eq!(strip_bearer("Bearer abc"), "abc");
        assert_eq!(strip_bearer("bearer abc"), "abc");
        assert_eq!(strip_bearer("  abc  "), "abc");
        assert_eq!(strip_bearer("abc"), "abc");
    }

    #[test]
    fn embeddings_render_as_pgvector_literal() {
        assert_eq!(embedding_to_pgvector(&[0.5, -1.0, 2.0]), "[0.5,-1,2]");
        assert_eq!(embedding_to_pgvector(&[]), "[]");
    }

    #[test]
    fn webhook_signature_verification() {
        let secret = "segredo";
        let body = b"{\"messageId\":\"m1\"}";
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_webhook_signature(secret, Some(&signature), body));
        assert!(verify_webhook_signature(
            secret,
            Some(&format!("sha256={signature}")),
            body
        ));
        assert!(!verify_webhook_signature(secret, Some("deadbeef"), body));
        assert!(!verify_webhook_signature(secret, None, body));
        // No secret configured means the check is a pass-through.
        assert!(verify_webhook_signature("", None, body));
    }

    #[test]
    fn query_text_whitespace_is_collapsed() {
        assert_eq!(normalize_query_text("  oi \n  tudo\tbem  "), "oi tudo bem");
        assert_eq!(normalize_query_text("   "), "");
    }

    #[test]
    fn tool_schema_declares_the_four_crm_tools() {
        let tools = gemini_tool_declarations();
        let declarations = tools[0]["function_declarations"].as_array().unwrap();
        let names = declarations
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "ghl_get_custom_fields",
                "ghl_manage_contact",
                "ghl_get_conversation",
                "ghl_get_contact"
            ]
        );
    }

    #[test]
    fn tool_call_traces_carry_status_or_error() {
        let outcome = ToolOutcome {
            ok: true,
            status: Some(200),
            body: json!({}),
        };
        let entry = tool_call_trace("ghl_get_contact", &outcome);
        assert_eq!(entry["ok"], true);
        assert_eq!(entry["status"], 200);

        let outcome = ToolOutcome::transport_error("connection refused");
        let entry = tool_call_trace("ghl_get_contact", &outcome);
        assert_eq!(entry["ok"], false);
        assert_eq!(entry["error"], "connection refused");
    }
}
