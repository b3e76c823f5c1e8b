//! In-memory demo pedal model
//!
//! A small stand-in for the real synthesis host so `stomplink serve` is
//! usable without hardware: a patch list, an active patch with parameters,
//! and a handful of feature flags. State changes are published on a
//! broadcast channel the composition root forwards to the relay.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::info;

use stomplink::{InitialStateEntry, ToolSet};
use stomplink_core::capability::CapabilityRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct Patch {
    pub id: String,
    pub name: String,
    pub params: BTreeMap<String, f64>,
}

struct PedalState {
    patches: Vec<Patch>,
    active: String,
    flags: BTreeMap<String, bool>,
}

/// The demo host model. One instance per process, shared by every handler.
pub struct DemoPedal {
    state: Mutex<PedalState>,
    events: broadcast::Sender<(String, Value)>,
}

fn patch(id: &str, name: &str, params: &[(&str, f64)]) -> Patch {
    Patch {
        id: id.to_string(),
        name: name.to_string(),
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect(),
    }
}

impl DemoPedal {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(PedalState {
                patches: vec![
                    patch("clean", "Clean Boost", &[("gain", 0.3), ("tone", 0.5)]),
                    patch("fuzz", "Velvet Fuzz", &[("gain", 0.8), ("sustain", 0.6)]),
                    patch("shimmer", "Shimmer Verb", &[("mix", 0.4), ("decay", 0.7)]),
                ],
                active: "clean".to_string(),
                flags: BTreeMap::from([
                    ("visualizer".to_string(), true),
                    ("midi-sync".to_string(), false),
                ]),
            }),
            events,
        }
    }

    /// Subscribe to state-change events `(channel, data)`.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, Value)> {
        self.events.subscribe()
    }

    fn emit(&self, channel: &str, data: Value) {
        let _ = self.events.send((channel.to_string(), data));
    }

    /// Snapshot queries replayed to every client on accept.
    pub fn initial_state() -> Vec<InitialStateEntry> {
        vec![
            InitialStateEntry::new("list-patches", "patch-list"),
            InitialStateEntry::new("get-active-patch", "active-patch-changed"),
            InitialStateEntry::new("get-feature-flags", "feature-flags-changed"),
        ]
    }

    /// The action/query surface this model exposes to the transport layer.
    pub fn capabilities(self: Arc<Self>) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();

        let pedal = self.clone();
        registry.register_query("list-patches", move |_args| {
            let pedal = pedal.clone();
            async move {
                let state = pedal.state.lock().unwrap();
                serde_json::to_value(&state.patches).map_err(|e| e.to_string())
            }
        });

        let pedal = self.clone();
        registry.register_query("get-active-patch", move |_args| {
            let pedal = pedal.clone();
            async move {
                let state = pedal.state.lock().unwrap();
                Ok(json!({ "id": state.active }))
            }
        });

        let pedal = self.clone();
        registry.register_query("get-feature-flags", move |_args| {
            let pedal = pedal.clone();
            async move {
                let state = pedal.state.lock().unwrap();
                serde_json::to_value(&state.flags).map_err(|e| e.to_string())
            }
        });

        let pedal = self.clone();
        registry.register_query("get-params", move |args| {
            let pedal = pedal.clone();
            async move {
                let state = pedal.state.lock().unwrap();
                let id = args
                    .first()
                    .and_then(|a| a.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or(&state.active)
                    .to_string();
                let found = state.patches.iter().find(|p| p.id == id);
                match found {
                    Some(p) => serde_json::to_value(&p.params).map_err(|e| e.to_string()),
                    None => Err(format!("no such patch: {id}")),
                }
            }
        });

        let pedal = self.clone();
        registry.register_action("select-patch", move |data| {
            let pedal = pedal.clone();
            async move {
                let id = data
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or("select-patch requires an id")?
                    .to_string();
                {
                    let mut state = pedal.state.lock().unwrap();
                    if !state.patches.iter().any(|p| p.id == id) {
                        return Err(format!("no such patch: {id}"));
                    }
                    state.active = id.clone();
                }
                info!(%id, "patch selected");
                pedal.emit("active-patch-changed", json!({ "id": id }));
                Ok(())
            }
        });

        let pedal = self.clone();
        registry.register_action("set-param", move |data| {
            let pedal = pedal.clone();
            async move {
                let name = data
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or("set-param requires a name")?
                    .to_string();
                let value = data
                    .get("value")
                    .and_then(Value::as_f64)
                    .ok_or("set-param requires a numeric value")?;
                let active = {
                    let mut state = pedal.state.lock().unwrap();
                    let active = state.active.clone();
                    let Some(p) = state.patches.iter_mut().find(|p| p.id == active) else {
                        return Err(format!("no such patch: {active}"));
                    };
                    p.params.insert(name.clone(), value);
                    active
                };
                pedal.emit(
                    "params-changed",
                    json!({ "id": active, "name": name, "value": value }),
                );
                Ok(())
            }
        });

        let pedal = self.clone();
        registry.register_action("toggle-feature", move |data| {
            let pedal = pedal.clone();
            async move {
                let name = data
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or("toggle-feature requires a name")?
                    .to_string();
                let (flags, enabled) = {
                    let mut state = pedal.state.lock().unwrap();
                    let enabled = !state.flags.get(&name).copied().unwrap_or(false);
                    state.flags.insert(name.clone(), enabled);
                    (state.flags.clone(), enabled)
                };
                info!(%name, enabled, "feature toggled");
                pedal.emit(
                    "feature-flags-changed",
                    serde_json::to_value(flags).map_err(|e| e.to_string())?,
                );
                Ok(())
            }
        });

        registry
    }

    /// The curated subset exposed to tool-calling agents.
    pub fn tools() -> ToolSet {
        ToolSet::new()
            .query_tool(
                "list_patches",
                "List the patches available on the pedal.",
                json!({ "type": "object", "properties": {} }),
                "list-patches",
            )
            .query_tool(
                "get_active_patch",
                "Return the id of the currently active patch.",
                json!({ "type": "object", "properties": {} }),
                "get-active-patch",
            )
            .query_tool(
                "get_params",
                "Return the parameter map of a patch (active patch if no id given).",
                json!({
                    "type": "object",
                    "properties": { "id": { "type": "string", "description": "Patch id" } }
                }),
                "get-params",
            )
            .action_tool(
                "select_patch",
                "Activate a patch by id.",
                json!({
                    "type": "object",
                    "properties": { "id": { "type": "string", "description": "Patch id" } },
                    "required": ["id"]
                }),
                "select-patch",
            )
            .action_tool(
                "toggle_feature",
                "Toggle a named feature flag.",
                json!({
                    "type": "object",
                    "properties": { "name": { "type": "string", "description": "Flag name" } },
                    "required": ["name"]
                }),
                "toggle-feature",
            )
    }
}

impl Default for DemoPedal {
    fn default() -> Self {
        Self::new()
    }
}
