//! Tool Calls
//!
//! The remote model asks the host to act through named tool calls carrying a
//! JSON argument payload. Each supported tool has a typed argument struct; a
//! call is decoded into the `ToolRequest` tagged union before any handler
//! sees it, so unknown names and malformed payloads become structured error
//! results instead of failures deep inside a handler.
//!
//! The argument structs double as the source of the JSON schemas advertised
//! to the model during session setup.

mod dispatcher;
mod handlers;

pub use dispatcher::{ToolDispatcher, ToolFuture, ToolHandler, ToolRegistry};
pub use handlers::{FavoritesToolHandler, LeadLookupHandler, MapToolHandler};

use schemars::{JsonSchema, generate::SchemaSettings};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::fmt;

/// A tool invocation as emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    FlyTo,
    ShowProperties,
    ShowArea,
    ClearMap,
    SaveFavorite,
    LookupLead,
}

impl ToolName {
    pub const ALL: [ToolName; 6] = [
        ToolName::FlyTo,
        ToolName::ShowProperties,
        ToolName::ShowArea,
        ToolName::ClearMap,
        ToolName::SaveFavorite,
        ToolName::LookupLead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::FlyTo => "fly_to",
            ToolName::ShowProperties => "show_properties",
            ToolName::ShowArea => "show_area",
            ToolName::ClearMap => "clear_map",
            ToolName::SaveFavorite => "save_favorite",
            ToolName::LookupLead => "lookup_lead",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolName::FlyTo => {
                "Move the 3D map camera to a specific location, e.g. when the user asks to see a landmark or address."
            }
            ToolName::ShowProperties => {
                "Place markers for a set of properties on the map and frame them all in view."
            }
            ToolName::ShowArea => {
                "Fly to a neighbourhood or community and optionally place markers for properties in it."
            }
            ToolName::ClearMap => "Remove every property marker from the map.",
            ToolName::SaveFavorite => "Save a property to the user's favorites.",
            ToolName::LookupLead => {
                "Search the CRM for leads or contacts by name, email, phone or interest."
            }
        }
    }

    fn parameters(&self) -> Value {
        match self {
            ToolName::FlyTo => parameters_for::<FlyToArgs>(),
            ToolName::ShowProperties => parameters_for::<ShowPropertiesArgs>(),
            ToolName::ShowArea => parameters_for::<ShowAreaArgs>(),
            ToolName::ClearMap => parameters_for::<ClearMapArgs>(),
            ToolName::SaveFavorite => parameters_for::<SaveFavoriteArgs>(),
            ToolName::LookupLead => parameters_for::<LookupLeadArgs>(),
        }
    }

    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.as_str().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A function declaration advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Builds an OpenAPI-style parameter schema with every subschema inlined.
/// Keys the live APIs reject (`$schema`, `title`, `format`) are stripped.
fn parameters_for<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::openapi3()
        .with(|settings| settings.inline_subschemas = true)
        .into_generator();
    let schema = generator.into_root_schema_for::<T>();
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| json!({ "type": "object" }));
    strip_unsupported_keys(&mut value);
    value
}

fn strip_unsupported_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("$schema");
            map.remove("title");
            map.remove("format");
            map.values_mut().for_each(strip_unsupported_keys);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_unsupported_keys),
        _ => {}
    }
}

// --- Argument payloads ---

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct FlyToArgs {
    /// Latitude of the destination in decimal degrees.
    pub latitude: f64,
    /// Longitude of the destination in decimal degrees.
    pub longitude: f64,
    /// Human readable name of the destination.
    #[serde(default)]
    pub label: Option<String>,
    /// Camera distance from the destination in meters.
    #[serde(default)]
    pub range: Option<f64>,
    /// Compass heading in degrees.
    #[serde(default)]
    pub heading: Option<f64>,
    /// Camera tilt in degrees, 0 looks straight down.
    #[serde(default)]
    pub tilt: Option<f64>,
}

/// A listing to place on the map.
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct PropertyArgs {
    /// Listing identifier.
    pub id: String,
    /// Listing title shown next to the marker.
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub bedrooms: Option<u32>,
    /// Property type such as villa, apartment or townhouse.
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct ShowPropertiesArgs {
    pub properties: Vec<PropertyArgs>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct ShowAreaArgs {
    /// Name of the area, e.g. "Dubai Hills".
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub range: Option<f64>,
    /// Properties in the area to mark on the map.
    #[serde(default)]
    pub properties: Vec<PropertyArgs>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, JsonSchema)]
pub struct ClearMapArgs {}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct SaveFavoriteArgs {
    pub property_id: String,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Why the user liked it, in their words.
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct LookupLeadArgs {
    /// Free text matched against name, email, phone and interest.
    pub query: String,
    /// Maximum number of leads to return.
    #[serde(default)]
    pub limit: Option<u32>,
}

/// A decoded, validated tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    FlyTo(FlyToArgs),
    ShowProperties(ShowPropertiesArgs),
    ShowArea(ShowAreaArgs),
    ClearMap,
    SaveFavorite(SaveFavoriteArgs),
    LookupLead(LookupLeadArgs),
}

impl ToolRequest {
    /// Decodes and validates the payload of a call.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ToolError> {
        let tool = ToolName::parse(name).ok_or_else(|| ToolError::UnsupportedTool {
            name: name.to_string(),
        })?;
        let request = match tool {
            ToolName::FlyTo => ToolRequest::FlyTo(decode(tool, args)?),
            ToolName::ShowProperties => ToolRequest::ShowProperties(decode(tool, args)?),
            ToolName::ShowArea => ToolRequest::ShowArea(decode(tool, args)?),
            ToolName::ClearMap => ToolRequest::ClearMap,
            ToolName::SaveFavorite => ToolRequest::SaveFavorite(decode(tool, args)?),
            ToolName::LookupLead => ToolRequest::LookupLead(decode(tool, args)?),
        };
        request.validate().map_err(|reason| ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason,
        })?;
        Ok(request)
    }

    pub fn name(&self) -> ToolName {
        match self {
            ToolRequest::FlyTo(_) => ToolName::FlyTo,
            ToolRequest::ShowProperties(_) => ToolName::ShowProperties,
            ToolRequest::ShowArea(_) => ToolName::ShowArea,
            ToolRequest::ClearMap => ToolName::ClearMap,
            ToolRequest::SaveFavorite(_) => ToolName::SaveFavorite,
            ToolRequest::LookupLead(_) => ToolName::LookupLead,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            ToolRequest::FlyTo(args) => {
                check_coordinates(args.latitude, args.longitude)?;
                check_positive("range", args.range)
            }
            ToolRequest::ShowProperties(args) => {
                args.properties.iter().try_for_each(check_property)
            }
            ToolRequest::ShowArea(args) => {
                check_coordinates(args.latitude, args.longitude)?;
                check_positive("range", args.range)?;
                args.properties.iter().try_for_each(check_property)
            }
            ToolRequest::ClearMap => Ok(()),
            ToolRequest::SaveFavorite(args) => {
                if args.property_id.trim().is_empty() {
                    return Err("property_id must not be empty".to_string());
                }
                match (args.latitude, args.longitude) {
                    (Some(lat), Some(lng)) => check_coordinates(lat, lng),
                    (None, None) => Ok(()),
                    _ => Err("latitude and longitude must be given together".to_string()),
                }
            }
            ToolRequest::LookupLead(args) => {
                if args.query.trim().is_empty() {
                    Err("query must not be empty".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn decode<T: DeserializeOwned>(tool: ToolName, args: &Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn check_coordinates(latitude: f64, longitude: f64) -> Result<(), String> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(format!("latitude {latitude} out of range"));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(format!("longitude {longitude} out of range"));
    }
    Ok(())
}

fn check_positive(field: &str, value: Option<f64>) -> Result<(), String> {
    match value {
        Some(v) if !(v.is_finite() && v > 0.0) => Err(format!("{field} must be positive")),
        _ => Ok(()),
    }
}

fn check_property(property: &PropertyArgs) -> Result<(), String> {
    if property.id.trim().is_empty() {
        return Err("property id must not be empty".to_string());
    }
    check_coordinates(property.latitude, property.longitude)
}

// --- Results ---

/// Structured tool failures, returned to the model in-band.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    #[error("unsupported tool: {name}")]
    UnsupportedTool { name: String },
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("handler timed out after {timeout_ms} ms")]
    TimedOut { timeout_ms: u64 },
    #[error("tool failed: {message}")]
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Result(Value),
    Error(ToolError),
}

/// The answer to a `ToolCall`, tagged with the originating call id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(call: &ToolCall, value: Value) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Result(value),
        }
    }

    pub fn failure(call: &ToolCall, error: ToolError) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// The body handed back to the model: `{"result": ..}` or
    /// `{"error": {"kind": .., "message": ..}}`.
    pub fn response_payload(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Result(value) => json!({ "result": value }),
            ToolOutcome::Error(error) => {
                let mut body = serde_json::to_value(error).unwrap_or_else(|_| json!({}));
                if let Some(map) = body.as_object_mut() {
                    map.insert("message".to_string(), Value::String(error.to_string()));
                }
                json!({ "error": body })
            }
        }
    }
}
