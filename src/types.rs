use serde::Deserialize;
use serde_json::Value;

/// Canonical shape of one inbound webhook delivery after envelope
/// unwrapping. The CRM emits both camelCase and snake_case spellings
/// depending on which integration relays the event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    #[serde(default, alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(default, alias = "webhook_id")]
    pub webhook_id: Option<String>,
    #[serde(default, alias = "conversation_id")]
    pub conversation_id: Option<String>,
    #[serde(default, alias = "location_id")]
    pub location_id: Option<String>,
    #[serde(default, alias = "contact_id")]
    pub contact_id: Option<String>,
    #[serde(default, alias = "message_type", alias = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default, alias = "conversation_provider_id")]
    pub conversation_provider_id: Option<String>,
    #[serde(default, alias = "date_added")]
    pub date_added: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    // Either the text itself or a nested { body: "..." } object.
    #[serde(default)]
    pub body: Option<Value>,
}

impl WebhookMessage {
    pub fn from_value(payload: &Value) -> WebhookMessage {
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }

    pub fn body_text(&self) -> String {
        match &self.body {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Object(map)) => map
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub location_id: String,
    pub name: String,
    pub personality: String,
    pub objective: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct InboundJob {
    pub id: String,
    pub message_id: String,
    pub agent_id: String,
    pub location_id: String,
    pub contact_id: String,
    pub conversation_id: String,
    pub batch_id: String,
    pub message_text: String,
    pub knowledge_base_ids: Vec<String>,
    pub message_type: Option<String>,
    pub conversation_provider_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KnowledgeItem {
    pub content: String,
    pub content_type: String,
    pub title: Option<String>,
    pub url: Option<String>,
}

/// Address fields pulled out of a CRM contact payload, tolerating the
/// field-name variants the API mixes across endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactAddress {
    pub street: String,
    pub address2: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

impl ContactAddress {
    pub fn has_any(&self) -> bool {
        !self.street.is_empty()
            || !self.address2.is_empty()
            || !self.city.is_empty()
            || !self.state.is_empty()
            || !self.postal_code.is_empty()
            || !self.country.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequestBody {
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn webhook_message_accepts_camel_case() {
        let msg = WebhookMessage::from_value(&json!({
            "messageId": "m1",
            "conversationId": "c1",
            "locationId": "l1",
            "contactId": "ct1",
            "messageType": "SMS",
            "direction": "inbound",
            "body": "oi"
        }));
        assert_eq!(msg.message_id.as_deref(), Some("m1"));
        assert_eq!(msg.conversation_id.as_deref(), Some("c1"));
        assert_eq!(msg.location_id.as_deref(), Some("l1"));
        assert_eq!(msg.contact_id.as_deref(), Some("ct1"));
        assert_eq!(msg.message_type.as_deref(), Some("SMS"));
        assert_eq!(msg.body_text(), "oi");
    }

    #[test]
    fn webhook_message_accepts_snake_case_and_type_alias() {
        let msg = WebhookMessage::from_value(&json!({
            "message_id": "m2",
            "conversation_id": "c2",
            "location_id": "l2",
            "contact_id": "ct2",
            "type": "WhatsApp",
            "conversation_provider_id": "prov1"
        }));
        assert_eq!(msg.message_id.as_deref(), Some("m2"));
        assert_eq!(msg.message_type.as_deref(), Some("WhatsApp"));
        assert_eq!(msg.conversation_provider_id.as_deref(), Some("prov1"));
    }

    #[test]
    fn body_text_unwraps_nested_body_object() {
        let msg = WebhookMessage::from_value(&json!({
            "messageId": "m3",
            "body": { "body": "mensagem aninhada" }
        }));
        assert_eq!(msg.body_text(), "mensagem aninhada");

        let empty = WebhookMessage::from_value(&json!({ "messageId": "m4" }));
        assert_eq!(empty.body_text(), "");
    }

    #[test]
    fn contact_address_has_any() {
        assert!(!ContactAddress::default().has_any());
        let addr = ContactAddress {
            city: "Campinas".to_string(),
            ..ContactAddress::default()
        };
        assert!(addr.has_any());
    }
}
