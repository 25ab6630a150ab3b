//! Saved description of a pipeline: stages, connections, entry points and
//! per-stage configuration.
//!
//! ## XML layout
//!
//! ```text
//! <template name="…">
//!   <configuration>
//!     <entry stage="…">hex(JSON)</entry>
//!   </configuration>
//!   <stages>
//!     <stage index="0" name="…" plugin="…" class="…" configurable="true">
//!       <outputs><output>Default</output></outputs>
//!     </stage>
//!   </stages>
//!   <entrypoints>
//!     <entrypoint name="…"><stages><stage index="0" plugin="…" class="…"/></stages></entrypoint>
//!   </entrypoints>
//!   <connections>
//!     <connection>
//!       <source index="0" name="…" plugin="…" class="…"/>
//!       <destination index="1" name="…" plugin="…" class="…"/>
//!       <output>Default</output>
//!     </connection>
//!   </connections>
//! </template>
//! ```
//!
//! Loading against a [`StageRegistry`] tolerates drift: stages whose kind is
//! no longer registered are dropped, and so is anything that referenced
//! them. Every dropped part is logged.

use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, warn};

use crate::xml::{self, Element, XmlWriter};
use crate::{Error, Result};

use super::registry::{StageDescriptor, StageKey, StageRegistry};
use super::stage::DEFAULT_OUTPUT;
use super::stages::{APPLY_PROPERTIES, BUILD_GRAPH, BUILTIN_PLUGIN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStage {
    /// Unique within the template; configuration is keyed by it.
    pub name: String,
    pub plugin: String,
    pub kind: String,
    pub configurable: bool,
    pub outputs: Vec<String>,
}

impl TemplateStage {
    pub fn key(&self) -> StageKey {
        StageKey::new(&self.plugin, &self.kind)
    }

    pub fn has_output(&self, output: &str) -> bool {
        self.outputs.iter().any(|o| o == output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateConnection {
    pub source: usize,
    pub output: String,
    pub destination: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEntryPoint {
    pub name: String,
    pub stages: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub name: String,
    pub stages: Vec<TemplateStage>,
    pub connections: Vec<TemplateConnection>,
    pub entry_points: Vec<TemplateEntryPoint>,
    pub configuration: BTreeMap<String, JsonValue>,
}

impl PipelineTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Graph builder feeding the property applier, one entry point.
    pub fn default_template() -> Self {
        let registry = StageRegistry::with_builtins();
        let mut template = Self::new("Default");
        let stages: Vec<usize> = [BUILD_GRAPH, APPLY_PROPERTIES]
            .into_iter()
            .filter_map(|kind| registry.lookup(BUILTIN_PLUGIN, kind))
            .map(|descriptor| template.add_stage(descriptor))
            .collect();
        if let [build, apply] = stages[..] {
            template.connections.push(TemplateConnection {
                source: build,
                output: DEFAULT_OUTPUT.to_owned(),
                destination: apply,
            });
            template.entry_points.push(TemplateEntryPoint { name: DEFAULT_OUTPUT.to_owned(), stages: vec![build] });
        }
        template
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn entry_point(&self, name: &str) -> Option<&TemplateEntryPoint> {
        self.entry_points.iter().find(|e| e.name == name)
    }

    // ========================================================================
    // Editing
    // ========================================================================

    /// Append a stage named after the descriptor, made unique with a
    /// numeric suffix. Configurable stages get their default configuration.
    pub fn add_stage(&mut self, descriptor: &StageDescriptor) -> usize {
        let mut name = descriptor.display_name.clone();
        let mut suffix = 2;
        while self.stage_index(&name).is_some() {
            name = format!("{} ({suffix})", descriptor.display_name);
            suffix += 1;
        }
        self.add_stage_named(name, descriptor)
    }

    /// Append a stage under `name`. An existing stage of that name keeps
    /// its configuration slot.
    pub fn add_stage_named(&mut self, name: impl Into<String>, descriptor: &StageDescriptor) -> usize {
        let name = name.into();
        if descriptor.configurable {
            self.configuration
                .entry(name.clone())
                .or_insert_with(|| descriptor.default_config.clone());
        }
        self.stages.push(TemplateStage {
            name,
            plugin: descriptor.key.plugin.clone(),
            kind: descriptor.key.kind.clone(),
            configurable: descriptor.configurable,
            outputs: descriptor.outputs.clone(),
        });
        self.stages.len() - 1
    }

    /// Returns false when the connection already exists.
    pub fn add_connection(&mut self, source: usize, output: &str, destination: usize) -> Result<bool> {
        let from = self
            .stages
            .get(source)
            .ok_or_else(|| Error::InvalidArgument(format!("no stage at index {source}")))?;
        if destination >= self.stages.len() {
            return Err(Error::InvalidArgument(format!("no stage at index {destination}")));
        }
        if !from.has_output(output) {
            return Err(Error::InvalidArgument(format!("stage '{}' has no output '{output}'", from.name)));
        }
        let connection = TemplateConnection { source, output: output.to_owned(), destination };
        if self.connections.contains(&connection) {
            return Ok(false);
        }
        self.connections.push(connection);
        Ok(true)
    }

    pub fn remove_connection(&mut self, source: usize, output: &str, destination: usize) -> bool {
        let before = self.connections.len();
        self.connections
            .retain(|c| !(c.source == source && c.output == output && c.destination == destination));
        self.connections.len() != before
    }

    /// Add stages to an entry point, creating it when needed.
    pub fn add_entry_point(&mut self, name: &str, stages: impl IntoIterator<Item = usize>) -> Result<()> {
        let stages: Vec<usize> = stages.into_iter().collect();
        if let Some(bad) = stages.iter().find(|&&i| i >= self.stages.len()) {
            return Err(Error::InvalidArgument(format!("no stage at index {bad}")));
        }
        let entry = match self.entry_points.iter_mut().position(|e| e.name == name) {
            Some(i) => &mut self.entry_points[i],
            None => {
                self.entry_points.push(TemplateEntryPoint { name: name.to_owned(), stages: Vec::new() });
                let last = self.entry_points.len() - 1;
                &mut self.entry_points[last]
            }
        };
        for stage in stages {
            if !entry.stages.contains(&stage) {
                entry.stages.push(stage);
            }
        }
        Ok(())
    }

    pub fn remove_entry_point(&mut self, name: &str) -> Option<TemplateEntryPoint> {
        let index = self.entry_points.iter().position(|e| e.name == name)?;
        Some(self.entry_points.remove(index))
    }

    /// Remove a stage with every connection and entry reference to it.
    /// Later stages shift down by one.
    pub fn remove_stage(&mut self, index: usize) -> Result<TemplateStage> {
        if index >= self.stages.len() {
            return Err(Error::InvalidArgument(format!("no stage at index {index}")));
        }
        let removed = self.stages.remove(index);
        let shift = |i: usize| if i > index { i - 1 } else { i };

        self.connections.retain(|c| c.source != index && c.destination != index);
        for connection in &mut self.connections {
            connection.source = shift(connection.source);
            connection.destination = shift(connection.destination);
        }
        for entry in &mut self.entry_points {
            entry.stages.retain(|&s| s != index);
            for stage in &mut entry.stages {
                *stage = shift(*stage);
            }
        }
        self.clean_configuration(&removed.name);
        Ok(removed)
    }

    pub fn set_configuration(&mut self, stage_name: &str, config: JsonValue) -> Result<()> {
        let index = self
            .stage_index(stage_name)
            .ok_or_else(|| Error::InvalidArgument(format!("no stage named '{stage_name}'")))?;
        if !self.stages[index].configurable {
            return Err(Error::InvalidArgument(format!("stage '{stage_name}' is not configurable")));
        }
        self.configuration.insert(stage_name.to_owned(), config);
        Ok(())
    }

    pub fn configuration_for(&self, stage_name: &str) -> Option<&JsonValue> {
        self.configuration.get(stage_name)
    }

    /// Drop the configuration of `stage_name` unless a stage still has
    /// that name.
    pub fn clean_configuration(&mut self, stage_name: &str) {
        if self.stage_index(stage_name).is_none() {
            self.configuration.remove(stage_name);
        }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Reconcile with what `registry` provides. Broken parts are logged and
    /// left out of the result.
    pub fn validate(&self, registry: &StageRegistry) -> PipelineTemplate {
        let mut result = PipelineTemplate::new(self.name.clone());
        let mut remap: Vec<Option<usize>> = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let Some(descriptor) = registry.get(&stage.key()) else {
                error!(template = %self.name, stage = %stage.name, kind = %stage.key(), "stage kind not available; stage dropped");
                remap.push(None);
                continue;
            };
            let mut stage = stage.clone();
            if stage.outputs != descriptor.outputs {
                warn!(
                    template = %self.name,
                    stage = %stage.name,
                    saved = ?stage.outputs,
                    current = ?descriptor.outputs,
                    "stage outputs changed"
                );
                stage.outputs = descriptor.outputs.clone();
            }
            stage.configurable = descriptor.configurable;
            result.stages.push(stage);
            remap.push(Some(result.stages.len() - 1));
        }
        let mapped = |i: usize| remap.get(i).copied().flatten();

        for connection in &self.connections {
            let (Some(source), Some(destination)) = (mapped(connection.source), mapped(connection.destination))
            else {
                warn!(template = %self.name, ?connection, "connection references a missing stage; skipped");
                continue;
            };
            if !result.stages[source].has_output(&connection.output) {
                warn!(template = %self.name, ?connection, "connection uses an undefined output; skipped");
                continue;
            }
            let connection = TemplateConnection { source, output: connection.output.clone(), destination };
            if !result.connections.contains(&connection) {
                result.connections.push(connection);
            }
        }

        for entry in &self.entry_points {
            let mut stages = Vec::with_capacity(entry.stages.len());
            for &stage in &entry.stages {
                match mapped(stage) {
                    Some(index) => stages.push(index),
                    None => warn!(template = %self.name, entry = %entry.name, stage, "entry point stage missing; skipped"),
                }
            }
            if stages.is_empty() {
                warn!(template = %self.name, entry = %entry.name, "entry point has no stages left; skipped");
                continue;
            }
            result.entry_points.push(TemplateEntryPoint { name: entry.name.clone(), stages });
        }

        for (name, config) in &self.configuration {
            if result.stage_index(name).is_some_and(|i| result.stages[i].configurable) {
                result.configuration.insert(name.clone(), config.clone());
            }
        }
        result
    }

    // ========================================================================
    // XML
    // ========================================================================

    pub fn save(&self) -> Result<String> {
        let mut writer = XmlWriter::new(Vec::new());
        writer.declaration()?;
        self.write_xml(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse a saved template; with a registry the result is validated.
    pub fn load(text: &str, registry: Option<&StageRegistry>) -> Result<Self> {
        let root = xml::parse(text)?;
        let template = Self::from_element(&root)?;
        Ok(match registry {
            Some(registry) => template.validate(registry),
            None => template,
        })
    }

    pub(crate) fn write_xml<W: Write>(&self, w: &mut XmlWriter<W>) -> Result<()> {
        w.start("template", &[("name", self.name.as_str())])?;

        w.start("configuration", &[])?;
        for (stage, config) in &self.configuration {
            let encoded = hex::encode(serde_json::to_vec(config)?);
            w.text_element("entry", &[("stage", stage.as_str())], &encoded)?;
        }
        w.end("configuration")?;

        w.start("stages", &[])?;
        for (index, stage) in self.stages.iter().enumerate() {
            let index = index.to_string();
            let configurable = stage.configurable.to_string();
            w.start(
                "stage",
                &[
                    ("index", index.as_str()),
                    ("name", stage.name.as_str()),
                    ("plugin", stage.plugin.as_str()),
                    ("class", stage.kind.as_str()),
                    ("configurable", configurable.as_str()),
                ],
            )?;
            w.start("outputs", &[])?;
            for output in &stage.outputs {
                w.text_element("output", &[], output)?;
            }
            w.end("outputs")?;
            w.end("stage")?;
        }
        w.end("stages")?;

        w.start("entrypoints", &[])?;
        for entry in &self.entry_points {
            w.start("entrypoint", &[("name", entry.name.as_str())])?;
            w.start("stages", &[])?;
            for &index in &entry.stages {
                let stage = self.stage_at(index)?;
                let index = index.to_string();
                w.empty(
                    "stage",
                    &[("index", index.as_str()), ("plugin", stage.plugin.as_str()), ("class", stage.kind.as_str())],
                )?;
            }
            w.end("stages")?;
            w.end("entrypoint")?;
        }
        w.end("entrypoints")?;

        w.start("connections", &[])?;
        for connection in &self.connections {
            w.start("connection", &[])?;
            for (element, index) in [("source", connection.source), ("destination", connection.destination)] {
                let stage = self.stage_at(index)?;
                let index = index.to_string();
                w.empty(
                    element,
                    &[
                        ("index", index.as_str()),
                        ("name", stage.name.as_str()),
                        ("plugin", stage.plugin.as_str()),
                        ("class", stage.kind.as_str()),
                    ],
                )?;
            }
            w.text_element("output", &[], &connection.output)?;
            w.end("connection")?;
        }
        w.end("connections")?;

        w.end("template")
    }

    pub(crate) fn from_element(root: &Element) -> Result<Self> {
        if root.name != "template" {
            return Err(Error::Serialization(format!("expected <template>, found <{}>", root.name)));
        }
        let mut template = PipelineTemplate::new(root.attr("name").unwrap_or_default());

        for entry in root.list("configuration", "entry") {
            let stage = entry.required("stage")?;
            let bytes = hex::decode(entry.text.trim())?;
            template.configuration.insert(stage.to_owned(), serde_json::from_slice(&bytes)?);
        }

        for stage in root.list("stages", "stage") {
            template.stages.push(TemplateStage {
                name: stage.required("name")?.to_owned(),
                plugin: stage.required("plugin")?.to_owned(),
                kind: stage.required("class")?.to_owned(),
                configurable: stage.attr("configurable").is_some_and(|v| v == "true"),
                outputs: stage.list("outputs", "output").map(|o| o.text.clone()).collect(),
            });
        }

        for entry in root.list("entrypoints", "entrypoint") {
            let stages = entry
                .list("stages", "stage")
                .map(|s| s.parse_attr::<usize>("index"))
                .collect::<Result<Vec<_>>>()?;
            template.entry_points.push(TemplateEntryPoint { name: entry.required("name")?.to_owned(), stages });
        }

        for connection in root.list("connections", "connection") {
            let end = |name: &str| -> Result<usize> {
                connection
                    .child(name)
                    .ok_or_else(|| Error::Serialization(format!("<connection> is missing <{name}>")))?
                    .parse_attr("index")
            };
            let output = connection
                .child("output")
                .map(|o| o.text.clone())
                .ok_or_else(|| Error::Serialization("<connection> is missing <output>".into()))?;
            template.connections.push(TemplateConnection {
                source: end("source")?,
                output,
                destination: end("destination")?,
            });
        }
        Ok(template)
    }

    fn stage_at(&self, index: usize) -> Result<&TemplateStage> {
        self.stages
            .get(index)
            .ok_or_else(|| Error::Template(format!("template '{}' references stage {index}", self.name)))
    }
}
