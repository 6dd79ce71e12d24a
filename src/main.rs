use std::sync::{Arc, LazyLock};

use strum_macros::{AsRefStr, Display};

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt, model::*,
    service::RequestContext,
};
use schemars::{JsonSchema, SchemaGenerator};
use serde::{Deserialize, Serialize};

// Our own schema_for_type using schemars 0.9 with JSON Schema draft 2020-12 settings
fn schema_for_type<T: JsonSchema>() -> serde_json::Map<String, serde_json::Value> {
    let schema = SchemaGenerator::default().into_root_schema_for::<T>();
    let object = serde_json::to_value(schema).expect("failed to serialize schema");
    match object {
        serde_json::Value::Object(object) => object,
        _ => panic!("unexpected schema value"),
    }
}

use clap::Parser;
use regex::Regex;
use reqwest::Client;
use rmcp::transport::stdio;
use serde_json::json;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

// =============================================================================
// Core Configuration & Client Abstractions
// =============================================================================

pub struct HubConfig {
    pub base_url: String,
    pub token: String,
}

impl HubConfig {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    /// The hub answered with a non-success HTTP status.
    #[error("Home Assistant API error: {status}")]
    Api { status: reqwest::StatusCode },

    /// The request never produced a usable response (DNS, refused
    /// connection, timeout, malformed body).
    #[error("network error reaching Home Assistant: {0}")]
    Network(#[from] reqwest::Error),
}

pub struct HubClient {
    config: HubConfig,
    http_client: Client,
}

impl HubClient {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            http_client: Client::new(),
        }
    }

    async fn rest_get<T: serde::de::DeserializeOwned>(&self, endpoint: &str) -> Result<T, HubError> {
        tracing::debug!(endpoint, "GET");
        let response = self
            .http_client
            .get(format!("{}/{}", self.config.base_url, endpoint))
            .header("Authorization", format!("Bearer {}", self.config.token))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HubError::Api {
                status: response.status(),
            });
        }

        Ok(response.json().await?)
    }

    /// Fetch the full entity list from `/api/states`, in hub order.
    pub async fn fetch_all_entities(&self) -> Result<Vec<Entity>, HubError> {
        self.rest_get("api/states").await
    }

    /// Fetch a single entity's current state object.
    pub async fn fetch_entity(&self, entity_id: &str) -> Result<Entity, HubError> {
        self.rest_get(&format!("api/states/{entity_id}")).await
    }

    /// Invoke a hub service (e.g. `light.turn_on`) against one entity.
    /// The response body is not consumed; only the status matters.
    pub async fn invoke_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
    ) -> Result<(), HubError> {
        tracing::debug!(domain, service, entity_id, "calling service");
        let response = self
            .http_client
            .post(format!(
                "{}/api/services/{}/{}",
                self.config.base_url, domain, service
            ))
            .header("Authorization", format!("Bearer {}", self.config.token))
            .json(&json!({ "entity_id": entity_id }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HubError::Api {
                status: response.status(),
            });
        }

        Ok(())
    }
}

// =============================================================================
// Entity Model
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    /// Category prefix of the entity id, e.g. "light" for "light.tank".
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or(&self.entity_id)
    }

    /// Segment after the first dot, empty if the id has no dot.
    pub fn object_id(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(_, rest)| rest)
            .unwrap_or("")
    }

    /// Human-readable label from the hub, only when present and non-empty.
    pub fn friendly_name(&self) -> Option<&str> {
        self.attributes
            .get("friendly_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn display_name(&self) -> &str {
        self.friendly_name().unwrap_or(&self.entity_id)
    }

    fn list_line(&self) -> String {
        format!(
            "{} | {} | {}",
            self.entity_id,
            self.friendly_name().unwrap_or("No name"),
            self.state
        )
    }
}

fn render_device_list(entities: &[Entity]) -> String {
    if entities.is_empty() {
        return "None".to_string();
    }
    entities
        .iter()
        .map(Entity::list_line)
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// Input Validation
// =============================================================================

static ENTITY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z0-9_]+\.[a-z0-9_]+$").unwrap());

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^[a-z0-9_]+$").unwrap());

static DESCRIPTION_STRIP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s-]").unwrap());

pub fn is_valid_entity_id(s: &str) -> bool {
    ENTITY_ID_RE.is_match(s)
}

pub fn is_valid_domain(s: &str) -> bool {
    DOMAIN_RE.is_match(s)
}

/// Reduce a free-text device description to word characters, whitespace and
/// hyphens, trimmed. An empty result means the input was unusable.
pub fn sanitize_description(s: &str) -> String {
    DESCRIPTION_STRIP_RE.replace_all(s, "").trim().to_string()
}

// =============================================================================
// Device Matcher
// =============================================================================

/// Pick the first entity, in hub order, whose friendly name or entity id
/// lines up with the (sanitized, non-empty) description. Substring
/// containment only; no scoring among candidates and no fuzzy fallback.
pub fn find_matching_entity<'a>(description: &str, entities: &'a [Entity]) -> Option<&'a Entity> {
    let description = description.to_lowercase();
    // "kitchen ceiling" should also hit entity ids like "light.kitchen_ceiling"
    let description_as_id = description.split_whitespace().collect::<Vec<_>>().join("_");

    entities.iter().find(|entity| {
        let entity_id = entity.entity_id.to_lowercase();
        let object_words = entity.object_id().to_lowercase().replace('_', " ");

        // An absent friendly name must not match: the empty string is a
        // substring of every description.
        if let Some(name) = entity.friendly_name() {
            let name = name.to_lowercase();
            if name.contains(&description) || description.contains(&name) {
                return true;
            }
        }

        entity_id.contains(&description_as_id)
            || (!object_words.is_empty() && description.contains(&object_words))
    })
}

// =============================================================================
// Tool Argument Structs with JSON Schema
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, AsRefStr)]
#[schemars(title = "Device Action")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ControlAction {
    TurnOn,
    TurnOff,
    GetState,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListDevicesArgs {
    /// Filter by domain e.g. light, switch, fan
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ControlDeviceArgs {
    /// Action to perform
    pub action: ControlAction,
    /// Natural language name of the device e.g. tank light, bedroom fan
    pub device_description: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TurnOnArgs {
    /// The entity ID to turn on
    pub entity_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TurnOffArgs {
    /// The entity ID to turn off
    pub entity_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetStateArgs {
    /// The entity ID to get the state of
    pub entity_id: String,
}

// =============================================================================
// Tool Handlers
// =============================================================================

pub struct HomeAssistantService {
    client: HubClient,
}

impl HomeAssistantService {
    pub fn new(config: HubConfig) -> Self {
        Self {
            client: HubClient::new(config),
        }
    }

    async fn list_devices(&self, args: ListDevicesArgs) -> Result<CallToolResult, McpError> {
        if let Some(domain) = &args.domain {
            if !is_valid_domain(domain) {
                return Ok(CallToolResult::success(vec![Content::text(
                    "Error: Invalid domain format.",
                )]));
            }
        }

        let mut entities = match self.client.fetch_all_entities().await {
            Ok(entities) => entities,
            Err(error) => {
                return Ok(CallToolResult::success(vec![Content::text(format!(
                    "❌ Failed to fetch devices: {error}"
                ))]));
            }
        };

        if let Some(domain) = &args.domain {
            let prefix = format!("{domain}.");
            entities.retain(|e| e.entity_id.starts_with(&prefix));
        }

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Available devices:\n{}",
            render_device_list(&entities)
        ))]))
    }

    async fn control_device(&self, args: ControlDeviceArgs) -> Result<CallToolResult, McpError> {
        let description = sanitize_description(&args.device_description);
        if description.is_empty() {
            return Ok(CallToolResult::success(vec![Content::text(
                "Error: Please provide a valid device description.",
            )]));
        }

        let entities = match self.client.fetch_all_entities().await {
            Ok(entities) => entities,
            Err(error) => {
                return Ok(CallToolResult::success(vec![Content::text(format!(
                    "❌ Failed to fetch devices: {error}"
                ))]));
            }
        };

        let Some(entity) = find_matching_entity(&description, &entities) else {
            return Ok(CallToolResult::success(vec![Content::text(format!(
                "Could not find a device matching \"{description}\".\n\nAvailable devices:\n{}",
                render_device_list(&entities)
            ))]));
        };

        if args.action == ControlAction::GetState {
            return Ok(CallToolResult::success(vec![Content::text(format!(
                "{} is currently {}",
                entity.display_name(),
                entity.state
            ))]));
        }

        match self
            .client
            .invoke_service(entity.domain(), args.action.as_ref(), &entity.entity_id)
            .await
        {
            Ok(()) => {
                let verb = if args.action == ControlAction::TurnOn {
                    "Turned on"
                } else {
                    "Turned off"
                };
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "✅ {verb} {}",
                    entity.display_name()
                ))]))
            }
            Err(error) => Ok(CallToolResult::success(vec![Content::text(format!(
                "❌ Failed to {} {}: {error}",
                args.action, entity.entity_id
            ))])),
        }
    }

    async fn switch_entity(
        &self,
        entity_id: &str,
        action: ControlAction,
    ) -> Result<CallToolResult, McpError> {
        if !is_valid_entity_id(entity_id) {
            return Ok(CallToolResult::success(vec![Content::text(
                "Error: Invalid entity_id format.",
            )]));
        }

        let domain = entity_id.split('.').next().unwrap_or(entity_id);
        let (done, doing) = if action == ControlAction::TurnOn {
            ("Turned on", "turn on")
        } else {
            ("Turned off", "turn off")
        };

        match self
            .client
            .invoke_service(domain, action.as_ref(), entity_id)
            .await
        {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text(format!(
                "✅ {done} {entity_id}"
            ))])),
            Err(error) => Ok(CallToolResult::success(vec![Content::text(format!(
                "❌ Failed to {doing} {entity_id}: {error}"
            ))])),
        }
    }

    async fn turn_on(&self, args: TurnOnArgs) -> Result<CallToolResult, McpError> {
        self.switch_entity(&args.entity_id, ControlAction::TurnOn).await
    }

    async fn turn_off(&self, args: TurnOffArgs) -> Result<CallToolResult, McpError> {
        self.switch_entity(&args.entity_id, ControlAction::TurnOff).await
    }

    async fn get_state(&self, args: GetStateArgs) -> Result<CallToolResult, McpError> {
        if !is_valid_entity_id(&args.entity_id) {
            return Ok(CallToolResult::success(vec![Content::text(
                "Error: Invalid entity_id format.",
            )]));
        }

        match self.client.fetch_entity(&args.entity_id).await {
            Ok(entity) => Ok(CallToolResult::success(vec![Content::text(format!(
                "{} is {}",
                args.entity_id, entity.state
            ))])),
            Err(error) => Ok(CallToolResult::success(vec![Content::text(format!(
                "❌ Failed to get state for {}: {error}",
                args.entity_id
            ))])),
        }
    }
}

// =============================================================================
// MCP Server Surface
// =============================================================================

impl ServerHandler for HomeAssistantService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server controls Home Assistant devices. Use list_devices to discover \
                 entities, control_device to act on a natural-language device description, \
                 and turn_on/turn_off/get_state when the entity_id is already known."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = vec![
            Tool::new(
                "list_devices",
                "List all devices with friendly names and states, optionally filtered by domain",
                Arc::new(schema_for_type::<ListDevicesArgs>()),
            ),
            Tool::new(
                "control_device",
                "Find the device best matching a natural-language description and turn it on or off, or report its state",
                Arc::new(schema_for_type::<ControlDeviceArgs>()),
            ),
            Tool::new(
                "turn_on",
                "Turn on a device by exact entity ID",
                Arc::new(schema_for_type::<TurnOnArgs>()),
            ),
            Tool::new(
                "turn_off",
                "Turn off a device by exact entity ID",
                Arc::new(schema_for_type::<TurnOffArgs>()),
            ),
            Tool::new(
                "get_state",
                "Get the current state of a device by exact entity ID",
                Arc::new(schema_for_type::<GetStateArgs>()),
            ),
        ];

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.unwrap_or_default();

        match request.name.as_ref() {
            "list_devices" => {
                let args: ListDevicesArgs = serde_json::from_value(serde_json::Value::Object(arguments))
                    .map_err(|e| McpError::invalid_params(
                        format!("list_devices: Invalid arguments - {}. Expected: {{\"domain\": \"string (optional)\"}}", e),
                        None,
                    ))?;
                self.list_devices(args).await
            }
            "control_device" => {
                let args: ControlDeviceArgs = serde_json::from_value(serde_json::Value::Object(arguments))
                    .map_err(|e| McpError::invalid_params(
                        format!("control_device: Invalid arguments - {}. Expected: {{\"action\": \"turn_on|turn_off|get_state\", \"device_description\": \"string\"}}", e),
                        None,
                    ))?;
                self.control_device(args).await
            }
            "turn_on" => {
                let args: TurnOnArgs = serde_json::from_value(serde_json::Value::Object(arguments))
                    .map_err(|e| McpError::invalid_params(
                        format!("turn_on: Invalid arguments - {}. Expected: {{\"entity_id\": \"string\"}}", e),
                        None,
                    ))?;
                self.turn_on(args).await
            }
            "turn_off" => {
                let args: TurnOffArgs = serde_json::from_value(serde_json::Value::Object(arguments))
                    .map_err(|e| McpError::invalid_params(
                        format!("turn_off: Invalid arguments - {}. Expected: {{\"entity_id\": \"string\"}}", e),
                        None,
                    ))?;
                self.turn_off(args).await
            }
            "get_state" => {
                let args: GetStateArgs = serde_json::from_value(serde_json::Value::Object(arguments))
                    .map_err(|e| McpError::invalid_params(
                        format!("get_state: Invalid arguments - {}. Expected: {{\"entity_id\": \"string\"}}", e),
                        None,
                    ))?;
                self.get_state(args).await
            }
            unknown_tool => Err(McpError::invalid_params(
                format!(
                    "Unknown tool: '{}'. Available tools: list_devices, control_device, turn_on, turn_off, get_state",
                    unknown_tool
                ),
                None,
            )),
        }
    }
}

// =============================================================================
// CLI & Entry Point
// =============================================================================

#[derive(Parser)]
#[command(name = "hass-control-mcp")]
#[command(about = "Home Assistant device control MCP server")]
#[command(version = "0.1.0")]
struct Cli {
    /// Home Assistant URL (e.g., http://homeassistant.local:8123)
    #[arg(long = "url", env = "HOME_ASSISTANT_URL", default_value = "")]
    url: String,

    /// Home Assistant long-lived access token
    #[arg(long = "token", env = "HOME_ASSISTANT_TOKEN", default_value = "")]
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if cli.url.is_empty() || cli.token.is_empty() {
        tracing::warn!(
            "HOME_ASSISTANT_URL and HOME_ASSISTANT_TOKEN not set. Server will start but tools may not function."
        );
    } else if let Err(error) = Url::parse(&cli.url) {
        tracing::warn!(%error, url = %cli.url, "HOME_ASSISTANT_URL does not parse as a URL");
    }

    let config = HubConfig::new(&cli.url, &cli.token);
    let service = HomeAssistantService::new(config);

    tracing::info!("🚀 Home Assistant control MCP server starting");
    tracing::info!("📡 Home Assistant URL: {}", cli.url);

    let server_service = service
        .serve(stdio())
        .await
        .inspect_err(|error| tracing::error!(%error, "Error serving"))?;

    server_service.waiting().await?;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
