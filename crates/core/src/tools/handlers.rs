use super::{PropertyArgs, ToolError, ToolHandler, ToolName, ToolRequest};
use crate::map::{CameraTarget, MapRequest, Marker, Position, ViewUpdate};
use crate::store::{FavoritesStore, LeadDirectory, NewFavorite};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const DEFAULT_LEAD_LIMIT: usize = 5;
const MAX_LEAD_LIMIT: usize = 20;

/// Translates map tools into `MapRequest`s for the session runtime, which
/// owns the choreographer.
pub struct MapToolHandler {
    requests: mpsc::Sender<MapRequest>,
}

impl MapToolHandler {
    pub fn new(requests: mpsc::Sender<MapRequest>) -> Self {
        Self { requests }
    }

    async fn send(&self, request: MapRequest) -> Result<(), ToolError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ToolError::Failed {
                message: "map is no longer available".to_string(),
            })
    }
}

fn property_marker(property: PropertyArgs) -> Marker {
    let mut metadata = Map::new();
    if let Some(price) = property.price {
        metadata.insert("price".to_string(), json!(price));
    }
    if let Some(currency) = property.currency {
        metadata.insert("currency".to_string(), json!(currency));
    }
    if let Some(bedrooms) = property.bedrooms {
        metadata.insert("bedrooms".to_string(), json!(bedrooms));
    }
    if let Some(kind) = property.kind {
        metadata.insert("kind".to_string(), json!(kind));
    }
    Marker {
        id: property.id,
        position: Position::new(property.latitude, property.longitude),
        label: property.name,
        metadata,
    }
}

#[async_trait]
impl ToolHandler for MapToolHandler {
    fn tools(&self) -> &'static [ToolName] {
        &[
            ToolName::FlyTo,
            ToolName::ShowProperties,
            ToolName::ShowArea,
            ToolName::ClearMap,
        ]
    }

    async fn handle(&self, request: ToolRequest) -> Result<Value, ToolError> {
        match request {
            ToolRequest::FlyTo(args) => {
                let target = CameraTarget {
                    position: Position::new(args.latitude, args.longitude),
                    heading: args.heading,
                    tilt: args.tilt,
                    range: args.range,
                };
                self.send(MapRequest::Update(ViewUpdate {
                    markers: None,
                    target: Some(target),
                }))
                .await?;
                Ok(json!({ "status": "flying", "destination": args.label }))
            }
            ToolRequest::ShowProperties(args) => {
                let markers: Vec<Marker> = args.properties.into_iter().map(property_marker).collect();
                let shown = markers.len();
                self.send(MapRequest::Update(ViewUpdate {
                    markers: Some(markers),
                    target: None,
                }))
                .await?;
                Ok(json!({ "status": "shown", "markers": shown }))
            }
            ToolRequest::ShowArea(args) => {
                let target = CameraTarget {
                    position: Position::new(args.latitude, args.longitude),
                    heading: None,
                    tilt: None,
                    range: args.range,
                };
                let markers = if args.properties.is_empty() {
                    None
                } else {
                    Some(args.properties.into_iter().map(property_marker).collect::<Vec<_>>())
                };
                let shown = markers.as_ref().map_or(0, Vec::len);
                self.send(MapRequest::Update(ViewUpdate {
                    markers,
                    target: Some(target),
                }))
                .await?;
                Ok(json!({ "status": "flying", "area": args.name, "markers": shown }))
            }
            ToolRequest::ClearMap => {
                self.send(MapRequest::Clear).await?;
                Ok(json!({ "status": "cleared" }))
            }
            other => Err(ToolError::UnsupportedTool {
                name: other.name().to_string(),
            }),
        }
    }
}

/// Saves favorites on behalf of the session's owner.
pub struct FavoritesToolHandler {
    store: Arc<dyn FavoritesStore>,
    owner_id: Option<String>,
    session_id: Option<Uuid>,
}

impl FavoritesToolHandler {
    pub fn new(
        store: Arc<dyn FavoritesStore>,
        owner_id: Option<String>,
        session_id: Option<Uuid>,
    ) -> Self {
        Self {
            store,
            owner_id,
            session_id,
        }
    }
}

#[async_trait]
impl ToolHandler for FavoritesToolHandler {
    fn tools(&self) -> &'static [ToolName] {
        &[ToolName::SaveFavorite]
    }

    async fn handle(&self, request: ToolRequest) -> Result<Value, ToolError> {
        let ToolRequest::SaveFavorite(args) = request else {
            return Err(ToolError::UnsupportedTool {
                name: request.name().to_string(),
            });
        };
        let position = match (args.latitude, args.longitude) {
            (Some(lat), Some(lng)) => Some(Position::new(lat, lng)),
            _ => None,
        };
        let saved = self
            .store
            .save_favorite(NewFavorite {
                owner_id: self.owner_id.clone(),
                session_id: self.session_id,
                property_id: args.property_id,
                name: args.name,
                position,
                note: args.note,
            })
            .await
            .map_err(|e| ToolError::Failed {
                message: e.to_string(),
            })?;
        Ok(json!({ "status": "saved", "favorite_id": saved.id, "name": saved.name }))
    }
}

pub struct LeadLookupHandler {
    directory: Arc<dyn LeadDirectory>,
}

impl LeadLookupHandler {
    pub fn new(directory: Arc<dyn LeadDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl ToolHandler for LeadLookupHandler {
    fn tools(&self) -> &'static [ToolName] {
        &[ToolName::LookupLead]
    }

    async fn handle(&self, request: ToolRequest) -> Result<Value, ToolError> {
        let ToolRequest::LookupLead(args) = request else {
            return Err(ToolError::UnsupportedTool {
                name: request.name().to_string(),
            });
        };
        let limit = args
            .limit
            .map_or(DEFAULT_LEAD_LIMIT, |l| l as usize)
            .clamp(1, MAX_LEAD_LIMIT);
        let leads = self
            .directory
            .find_leads(&args.query, limit)
            .await
            .map_err(|e| ToolError::Failed {
                message: e.to_string(),
            })?;
        Ok(json!({ "count": leads.len(), "leads": leads }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Lead, MemoryStore};

    #[tokio::test]
    async fn test_show_area_is_one_logical_update() {
        let (tx, mut rx) = mpsc::channel(4);
        let handler = MapToolHandler::new(tx);
        let request = ToolRequest::parse(
            "show_area",
            &json!({
                "name": "Dubai Hills",
                "latitude": 25.1124,
                "longitude": 55.2389,
                "properties": [
                    { "id": "p1", "name": "Sidra Villa", "latitude": 25.11, "longitude": 55.24, "price": 4200000 }
                ]
            }),
        )
        .unwrap();
        let value = handler.handle(request).await.unwrap();
        assert_eq!(value["markers"], 1);

        match rx.recv().await.unwrap() {
            MapRequest::Update(update) => {
                let markers = update.markers.unwrap();
                assert_eq!(markers[0].label, "Sidra Villa");
                assert_eq!(markers[0].metadata["price"], json!(4200000.0));
                assert_eq!(update.target.unwrap().position.latitude, 25.1124);
            }
            other => panic!("unexpected request {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_map_channel_fails_the_call() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handler = MapToolHandler::new(tx);
        let err = handler.handle(ToolRequest::ClearMap).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_save_favorite_uses_session_owner() {
        let store = Arc::new(MemoryStore::new());
        let session_id = Uuid::new_v4();
        let handler =
            FavoritesToolHandler::new(store.clone(), Some("user-7".to_string()), Some(session_id));
        let request = ToolRequest::parse(
            "save_favorite",
            &json!({ "property_id": "p1", "name": "Sidra Villa", "note": "big garden" }),
        )
        .unwrap();
        handler.handle(request).await.unwrap();

        let favorites = store.list_favorites("user-7").await.unwrap();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].session_id, Some(session_id));
        assert_eq!(favorites[0].note.as_deref(), Some("big garden"));
    }

    #[tokio::test]
    async fn test_lead_lookup_returns_matches() {
        let store = Arc::new(MemoryStore::with_leads(vec![Lead {
            id: Uuid::new_v4(),
            name: "Amira Haddad".to_string(),
            email: Some("amira@example.com".to_string()),
            phone: None,
            status: "qualified".to_string(),
            interest: Some("villa".to_string()),
        }]));
        let handler = LeadLookupHandler::new(store);
        let value = handler
            .handle(ToolRequest::parse("lookup_lead", &json!({ "query": "amira" })).unwrap())
            .await
            .unwrap();
        assert_eq!(value["count"], 1);
        assert_eq!(value["leads"][0]["name"], "Amira Haddad");
    }
}
