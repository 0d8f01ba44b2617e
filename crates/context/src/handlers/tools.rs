//! Tool configuration handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::AppState;
use civica_common::{
    errors::Result,
    tools::{ToolConfig, ToolConfigPatch, ToolConfigSnapshot, ToolName},
};

#[derive(Debug, Serialize)]
pub struct ToolView {
    pub name: ToolName,
    #[serde(flatten)]
    pub config: ToolConfig,
    pub allowed_models: &'static [&'static str],
}

impl ToolView {
    fn new(name: ToolName, config: ToolConfig) -> Self {
        Self {
            name,
            config,
            allowed_models: name.allowed_models(),
        }
    }
}

fn views(snapshot: &ToolConfigSnapshot) -> Vec<ToolView> {
    snapshot
        .iter()
        .map(|(name, config)| ToolView::new(*name, config.clone()))
        .collect()
}

/// List every tool with its current settings
pub async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolView>> {
    Json(views(&state.tools.snapshot().await))
}

pub async fn get_tool(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<ToolView>> {
    let tool: ToolName = name.parse()?;
    let config = state.tools.get(&name).await?;
    Ok(Json(ToolView::new(tool, config)))
}

/// Apply a partial update; affects runs started afterwards
pub async fn update_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<ToolConfigPatch>,
) -> Result<Json<ToolView>> {
    let tool: ToolName = name.parse()?;
    let config = state.tools.update(&name, patch).await?;
    Ok(Json(ToolView::new(tool, config)))
}

/// Re-read settings from the backing store
pub async fn reload_tools(State(state): State<AppState>) -> Result<Json<Vec<ToolView>>> {
    let snapshot = state.tools.reload().await?;
    Ok(Json(views(&snapshot)))
}
