use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const API_URL: &str = "https://api.perplexity.ai/chat/completions";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API key is not configured")]
    MissingApiKey,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("could not decode API response: {0}")]
    Decode(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Model {
    Sonar,
    SonarPro,
    SonarReasoning,
}

impl Model {
    pub fn all() -> &'static [Model] {
        &[Model::Sonar, Model::SonarPro, Model::SonarReasoning]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Sonar => "sonar",
            Model::SonarPro => "sonar-pro",
            Model::SonarReasoning => "sonar-reasoning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecencyFilter {
    Hour,
    Day,
    Week,
    Month,
}

impl RecencyFilter {
    pub fn all() -> &'static [RecencyFilter] {
        &[
            RecencyFilter::Hour,
            RecencyFilter::Day,
            RecencyFilter::Week,
            RecencyFilter::Month,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecencyFilter::Hour => "hour",
            RecencyFilter::Day => "day",
            RecencyFilter::Week => "week",
            RecencyFilter::Month => "month",
        }
    }
}

/// User-tunable request parameters. Each field is clamped by its settings
/// widget, so values here are always within the API's accepted ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestParams {
    pub model: Model,
    pub system_prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub search_recency: RecencyFilter,
    pub return_images: bool,
    pub return_related_questions: bool,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            model: Model::Sonar,
            system_prompt: "Be precise and concise.".to_string(),
            temperature: 0.2,
            max_tokens: 2000,
            top_p: 0.9,
            frequency_penalty: 1.0,
            presence_penalty: 0.0,
            search_recency: RecencyFilter::Month,
            return_images: false,
            return_related_questions: false,
        }
    }
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: &'static str,
    messages: Vec<WireMessage>,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
    frequency_penalty: f64,
    presence_penalty: f64,
    search_recency_filter: &'static str,
    return_images: bool,
    return_related_questions: bool,
}

impl ChatRequest {
    fn build(params: &RequestParams, user_prompt: &str) -> Self {
        Self {
            model: params.model.as_str(),
            messages: vec![
                WireMessage {
                    role: "system",
                    content: params.system_prompt.clone(),
                },
                WireMessage {
                    role: "user",
                    content: user_prompt.to_string(),
                },
            ],
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            search_recency_filter: params.search_recency.as_str(),
            return_images: params.return_images,
            return_related_questions: params.return_related_questions,
        }
    }
}

/// An image reference in the response. The API returns either a bare URL
/// string or an object carrying the URL under `url` or `image_url`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ImageRef {
    Url(String),
    Object {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        image_url: Option<String>,
        #[serde(default, alias = "alt")]
        title: Option<String>,
    },
}

impl ImageRef {
    pub fn url(&self) -> Option<&str> {
        match self {
            ImageRef::Url(u) => Some(u),
            ImageRef::Object { url, image_url, .. } => {
                url.as_deref().or(image_url.as_deref())
            }
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            ImageRef::Url(_) => None,
            ImageRef::Object { title, .. } => title.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub related_questions: Vec<String>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// The response reduced to what the chat transcript stores. `warning` is
/// set when fallback text was substituted for missing or truncated content.
#[derive(Debug, Clone)]
pub struct NormalizedReply {
    pub content: String,
    pub citations: Vec<String>,
    pub related_questions: Vec<String>,
    pub images: Vec<ImageRef>,
    pub warning: Option<String>,
}

pub fn normalize(response: ChatResponse) -> NormalizedReply {
    let ChatResponse {
        choices,
        citations,
        related_questions,
        images,
    } = response;

    let usable = choices.first().and_then(|choice| {
        let truncated = choice.finish_reason.as_deref() == Some("length");
        if truncated || choice.message.content.is_empty() {
            None
        } else {
            Some(choice.message.content.clone())
        }
    });

    let (content, warning) = match usable {
        Some(content) => (content, None),
        None => {
            let content = match citations.first() {
                Some(citation) => format!("See reference material: {}", citation),
                None => "No response generated.".to_string(),
            };
            let warning = "The model returned no usable answer; showing fallback text.";
            warn!("{}", warning);
            (content, Some(warning.to_string()))
        }
    };

    NormalizedReply {
        content,
        citations,
        related_questions,
        images,
        warning,
    }
}

#[derive(Clone)]
pub struct SonarClient {
    client: Client,
    base_url: String,
}

impl SonarClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: API_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.to_string(),
        }
    }

    /// Issue exactly one completion request. No retry, no proxy fallback:
    /// the credential only ever travels to the configured endpoint.
    pub async fn complete(
        &self,
        api_key: &str,
        params: &RequestParams,
        user_prompt: &str,
    ) -> Result<ChatResponse, ApiError> {
        if api_key.trim().is_empty() {
            return Err(ApiError::MissingApiKey);
        }

        let request = ChatRequest::build(params, user_prompt);
        debug!(model = params.model.as_str(), "sending completion request");

        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(code = status.as_u16(), "completion request rejected");
            return Err(ApiError::Status {
                code: status.as_u16(),
                body,
            });
        }

        response.json::<ChatResponse>().await.map_err(ApiError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_from(json: &str) -> ChatResponse {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn empty_api_key_fails_before_any_network_activity() {
        // Unroutable base URL: if the client ever tried the network the
        // error would be Transport, not MissingApiKey.
        let client = SonarClient::with_base_url("http://127.0.0.1:0");
        let err = client
            .complete("", &RequestParams::default(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::MissingApiKey));

        let err = client
            .complete("   ", &RequestParams::default(), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::MissingApiKey));
    }

    #[tokio::test]
    async fn non_success_status_carries_code_and_body_text() {
        let base = crate::testutil::serve_once(
            "500 Internal Server Error",
            r#"{"error": "overloaded"}"#,
        )
        .await;
        let client = SonarClient::with_base_url(&base);

        let err = client
            .complete("pplx-test", &RequestParams::default(), "hello")
            .await
            .unwrap_err();

        match err {
            ApiError::Status { code, body } => {
                assert_eq!(code, 500);
                assert!(body.contains("overloaded"));
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[test]
    fn request_body_uses_the_wire_field_names() {
        let params = RequestParams::default();
        let request = ChatRequest::build(&params, "What moved TSLA today?");
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["model"], "sonar");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "What moved TSLA today?");
        assert_eq!(body["max_tokens"], 2000);
        assert_eq!(body["search_recency_filter"], "month");
        assert_eq!(body["return_images"], false);
        assert_eq!(body["return_related_questions"], false);
        assert!(body["top_p"].is_number());
        assert!(body["frequency_penalty"].is_number());
        assert!(body["presence_penalty"].is_number());
    }

    #[test]
    fn model_and_recency_serialize_to_api_identifiers() {
        assert_eq!(Model::SonarPro.as_str(), "sonar-pro");
        assert_eq!(Model::SonarReasoning.as_str(), "sonar-reasoning");
        assert_eq!(RecencyFilter::Hour.as_str(), "hour");
        assert_eq!(
            serde_json::to_string(&Model::SonarPro).unwrap(),
            "\"sonar-pro\""
        );
    }

    #[test]
    fn images_decode_from_strings_or_objects() {
        let response = response_from(
            r#"{
                "choices": [{"message": {"content": "ok"}}],
                "images": [
                    "https://example.com/a.png",
                    {"url": "https://example.com/b.png", "title": "chart"},
                    {"image_url": "https://example.com/c.png", "alt": "photo"}
                ]
            }"#,
        );

        let urls: Vec<_> = response.images.iter().filter_map(|i| i.url()).collect();
        assert_eq!(
            urls,
            [
                "https://example.com/a.png",
                "https://example.com/b.png",
                "https://example.com/c.png"
            ]
        );
        assert_eq!(response.images[1].title(), Some("chart"));
        assert_eq!(response.images[2].title(), Some("photo"));
    }

    #[test]
    fn normalize_passes_content_and_citations_through() {
        let reply = normalize(response_from(
            r#"{
                "choices": [{"message": {"content": "X"}, "finish_reason": "stop"}],
                "citations": ["c1"]
            }"#,
        ));
        assert_eq!(reply.content, "X");
        assert_eq!(reply.citations, ["c1"]);
        assert!(reply.warning.is_none());
    }

    #[test]
    fn normalize_substitutes_first_citation_on_truncation() {
        let reply = normalize(response_from(
            r#"{
                "choices": [{"message": {"content": "partial"}, "finish_reason": "length"}],
                "citations": ["ref1"]
            }"#,
        ));
        assert_eq!(reply.content, "See reference material: ref1");
        assert!(reply.warning.is_some());
    }

    #[test]
    fn normalize_falls_back_to_placeholder_without_choices_or_citations() {
        let reply = normalize(response_from("{}"));
        assert_eq!(reply.content, "No response generated.");
        assert!(reply.warning.is_some());
        assert!(reply.citations.is_empty());
        assert!(reply.related_questions.is_empty());
        assert!(reply.images.is_empty());
    }
}
