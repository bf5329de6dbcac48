//! JSON configuration parsing.
//!
//! The top-level keys pick the handle variant: `single` or `pipeline` build
//! an extension, `offloading` builds an offloading endpoint. An optional
//! `information` object is applied to the handle in member order after
//! construction.

use std::path::PathBuf;

use serde_json::{Map, Value};

use axon_core::{ElementType, Result, ServiceError, TensorsInfo};
use axon_edge::{ConnectType, EdgeRole};

/// Parsed configuration file.
#[derive(Debug)]
pub struct ServiceConfig {
    pub variant: VariantConfig,
    pub information: Vec<(String, String)>,
}

#[derive(Debug)]
pub enum VariantConfig {
    Single(SingleConfig),
    Pipeline(PipelineExtConfig),
    Offloading(OffloadingConfig),
}

/// `single` object: one model opened through a single-shot backend.
#[derive(Debug, Default)]
pub struct SingleConfig {
    /// Catalog key resolving to the activated model.
    pub key: Option<String>,
    /// Direct model paths (comma-joined in the config).
    pub models: Vec<PathBuf>,
    pub framework: Option<String>,
    pub input_info: Option<TensorsInfo>,
    pub output_info: Option<TensorsInfo>,
    pub custom: Option<String>,
}

/// `pipeline` object: a described pipeline with named input/output nodes.
#[derive(Debug, Default)]
pub struct PipelineExtConfig {
    pub key: Option<String>,
    pub description: Option<String>,
    pub input_nodes: Vec<NodeConfig>,
    pub output_nodes: Vec<NodeConfig>,
}

#[derive(Debug)]
pub struct NodeConfig {
    pub name: String,
    pub info: TensorsInfo,
}

/// `offloading` object plus its sibling `services` table.
#[derive(Debug)]
pub struct OffloadingConfig {
    pub node_type: EdgeRole,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dest_host: Option<String>,
    pub dest_port: Option<u16>,
    pub connect_type: ConnectType,
    pub topic: Option<String>,
    pub id: Option<String>,
    /// Receiver-side save directory.
    pub path: Option<PathBuf>,
    pub services: Vec<(String, ServiceDescriptor)>,
    pub training: Option<TrainingConfig>,
}

/// Wire-level service types carried in the `service-type` info field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadServiceType {
    ModelRaw,
    ModelUri,
    PipelineRaw,
    PipelineUri,
    Reply,
    Launch,
}

impl OffloadServiceType {
    pub fn parse(s: &str) -> Result<OffloadServiceType> {
        match s.to_ascii_lowercase().as_str() {
            "model_raw" => Ok(OffloadServiceType::ModelRaw),
            "model_uri" => Ok(OffloadServiceType::ModelUri),
            "pipeline_raw" => Ok(OffloadServiceType::PipelineRaw),
            "pipeline_uri" => Ok(OffloadServiceType::PipelineUri),
            "reply" => Ok(OffloadServiceType::Reply),
            "launch" => Ok(OffloadServiceType::Launch),
            other => Err(ServiceError::invalid(format!(
                "unknown service type '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OffloadServiceType::ModelRaw => "model_raw",
            OffloadServiceType::ModelUri => "model_uri",
            OffloadServiceType::PipelineRaw => "pipeline_raw",
            OffloadServiceType::PipelineUri => "pipeline_uri",
            OffloadServiceType::Reply => "reply",
            OffloadServiceType::Launch => "launch",
        }
    }
}

/// One row of the `services` table.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub service_type: OffloadServiceType,
    pub service_key: String,
    pub description: Option<String>,
    pub name: Option<String>,
    pub activate: bool,
}

/// Training sub-mode of an offloading endpoint.
#[derive(Debug)]
pub struct TrainingConfig {
    pub node_type: EdgeRole,
    pub time_limit_s: u32,
    pub sender_pipeline: Option<String>,
    /// name -> local file path or inline pipeline JSON (as a string).
    pub transfer_data: Vec<(String, String)>,
}

pub const DEFAULT_TRAINING_TIME_LIMIT_S: u32 = 10;

impl ServiceConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<ServiceConfig> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServiceError::invalid(format!(
                "cannot read configuration '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<ServiceConfig> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| ServiceError::invalid(format!("configuration is not valid JSON: {e}")))?;
        let root = as_object(&root, "configuration")?;

        let variant = if let Some(single) = root.get("single") {
            VariantConfig::Single(parse_single(as_object(single, "single")?)?)
        } else if let Some(pipe) = root.get("pipeline") {
            VariantConfig::Pipeline(parse_pipeline(as_object(pipe, "pipeline")?)?)
        } else if let Some(off) = root.get("offloading") {
            VariantConfig::Offloading(parse_offloading(
                as_object(off, "offloading")?,
                root.get("services"),
            )?)
        } else {
            return Err(ServiceError::invalid(
                "configuration must contain a 'single', 'pipeline' or 'offloading' object",
            ));
        };

        let mut information = Vec::new();
        if let Some(info) = root.get("information") {
            for (key, value) in as_object(info, "information")? {
                information.push((key.clone(), string_value(value, key)?));
            }
        }

        Ok(ServiceConfig {
            variant,
            information,
        })
    }
}

fn parse_single(single: &Map<String, Value>) -> Result<SingleConfig> {
    let mut config = SingleConfig {
        key: optional_string(single, "key")?,
        ..SingleConfig::default()
    };

    if let Some(model) = single.get("model") {
        let joined = string_value(model, "model")?;
        config.models = joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
    }
    if config.key.is_none() && config.models.is_empty() {
        return Err(ServiceError::invalid(
            "'single' requires either 'key' or 'model'",
        ));
    }

    config.framework = optional_string(single, "framework")?;
    config.custom = optional_string(single, "custom")?;
    if let Some(info) = single.get("input_info") {
        config.input_info = Some(parse_tensors_info(info)?);
    }
    if let Some(info) = single.get("output_info") {
        config.output_info = Some(parse_tensors_info(info)?);
    }
    Ok(config)
}

fn parse_pipeline(pipe: &Map<String, Value>) -> Result<PipelineExtConfig> {
    let mut config = PipelineExtConfig {
        key: optional_string(pipe, "key")?,
        description: optional_string(pipe, "description")?,
        ..PipelineExtConfig::default()
    };
    if config.key.is_none() && config.description.is_none() {
        return Err(ServiceError::invalid(
            "'pipeline' requires either 'key' or 'description'",
        ));
    }

    config.input_nodes = parse_node_list(pipe.get("input_node"), "input_node")?;
    config.output_nodes = parse_node_list(pipe.get("output_node"), "output_node")?;
    if config.input_nodes.is_empty() || config.output_nodes.is_empty() {
        return Err(ServiceError::invalid(
            "'pipeline' requires non-empty 'input_node' and 'output_node' lists",
        ));
    }
    Ok(config)
}

fn parse_node_list(value: Option<&Value>, what: &str) -> Result<Vec<NodeConfig>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let nodes = match value {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        Value::Object(_) => vec![value],
        _ => {
            return Err(ServiceError::invalid(format!(
                "'{what}' must be a node object or an array of node objects"
            )))
        }
    };
    nodes
        .into_iter()
        .map(|node| {
            let node = as_object(node, what)?;
            let name = optional_string(node, "name")?
                .ok_or_else(|| ServiceError::invalid(format!("'{what}' entry needs a 'name'")))?;
            let info = node
                .get("info")
                .ok_or_else(|| ServiceError::invalid(format!("'{what}' entry needs an 'info'")))?;
            let info = parse_tensors_info(info)?;
            if !info.validate() {
                return Err(ServiceError::invalid(format!(
                    "'{what}' entry '{name}' has an incomplete tensors descriptor"
                )));
            }
            Ok(NodeConfig { name, info })
        })
        .collect()
}

/// `TensorInfo | [TensorInfo, ...]`, each entry
/// `{ type?, dimension? ("d0:d1:..."), name? }`.
pub fn parse_tensors_info(value: &Value) -> Result<TensorsInfo> {
    let entries = match value {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        Value::Object(_) => vec![value],
        _ => {
            return Err(ServiceError::invalid(
                "tensors info must be an object or an array of objects",
            ))
        }
    };
    let mut info = TensorsInfo::with_count(entries.len())?;
    for (i, entry) in entries.iter().enumerate() {
        let entry = as_object(entry, "tensors info")?;
        if let Some(ty) = optional_string(entry, "type")? {
            info.set_type(i, ElementType::parse(&ty)?)?;
        }
        if let Some(dims) = optional_string(entry, "dimension")? {
            info.set_dimension(i, &parse_dimension(&dims)?)?;
        }
        if let Some(name) = optional_string(entry, "name")? {
            info.set_name(i, Some(name.as_str()))?;
        }
    }
    Ok(info)
}

fn parse_dimension(dims: &str) -> Result<Vec<u32>> {
    dims.split(':')
        .map(|d| {
            d.trim()
                .parse::<u32>()
                .map_err(|_| ServiceError::invalid(format!("invalid dimension string '{dims}'")))
        })
        .collect()
}

fn parse_offloading(
    off: &Map<String, Value>,
    services: Option<&Value>,
) -> Result<OffloadingConfig> {
    let node_type = match required_string(off, "node-type", "offloading")?.as_str() {
        "sender" => EdgeRole::Sender,
        "receiver" => EdgeRole::Receiver,
        other => {
            return Err(ServiceError::invalid(format!(
                "offloading node-type must be 'sender' or 'receiver', got '{other}'"
            )))
        }
    };

    let connect_type = match optional_string(off, "connect-type")? {
        Some(ct) => ConnectType::parse(&ct)?,
        None => ConnectType::Tcp,
    };

    let mut config = OffloadingConfig {
        node_type,
        host: optional_string(off, "host")?,
        port: optional_port(off, "port")?,
        dest_host: optional_string(off, "dest-host")?,
        dest_port: optional_port(off, "dest-port")?,
        connect_type,
        topic: optional_string(off, "topic")?,
        id: optional_string(off, "id")?,
        path: optional_string(off, "path")?.map(PathBuf::from),
        services: Vec::new(),
        training: None,
    };

    if node_type == EdgeRole::Sender {
        if config.dest_host.is_none() || config.dest_port.is_none() {
            return Err(ServiceError::invalid(
                "offloading sender requires 'dest-host' and 'dest-port'",
            ));
        }
        if config.topic.is_none() {
            return Err(ServiceError::invalid("offloading sender requires 'topic'"));
        }
    }

    if let Some(services) = services {
        for (key, value) in as_object(services, "services")? {
            config
                .services
                .push((key.clone(), parse_service_descriptor(key, value)?));
        }
    }

    if let Some(training) = off.get("training") {
        config.training = Some(parse_training(as_object(training, "training")?)?);
    }
    Ok(config)
}

pub fn parse_service_descriptor(key: &str, value: &Value) -> Result<ServiceDescriptor> {
    // Descriptors may arrive as JSON strings (the table stores them
    // verbatim) or as inline objects.
    let parsed;
    let object = match value {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s).map_err(|e| {
                ServiceError::invalid(format!("service '{key}' descriptor is not JSON: {e}"))
            })?;
            as_object(&parsed, "service descriptor")?
        }
        _ => as_object(value, "service descriptor")?,
    };

    let service_type =
        OffloadServiceType::parse(&required_string(object, "service-type", key)?)?;
    let service_key = required_string(object, "service-key", key)?;
    Ok(ServiceDescriptor {
        service_type,
        service_key,
        description: optional_string(object, "description")?,
        name: optional_string(object, "name")?,
        activate: optional_string(object, "activate")?
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    })
}

fn parse_training(training: &Map<String, Value>) -> Result<TrainingConfig> {
    let node_type = match required_string(training, "node-type", "training")?.as_str() {
        "sender" => EdgeRole::Sender,
        "receiver" => EdgeRole::Receiver,
        other => {
            return Err(ServiceError::invalid(format!(
                "training node-type must be 'sender' or 'receiver', got '{other}'"
            )))
        }
    };

    let time_limit_s = match training.get("time-limit") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| ServiceError::invalid("training 'time-limit' must be a small integer"))?,
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| ServiceError::invalid("training 'time-limit' must be an integer"))?,
        Some(_) => {
            return Err(ServiceError::invalid(
                "training 'time-limit' must be an integer",
            ))
        }
        None => DEFAULT_TRAINING_TIME_LIMIT_S,
    };

    let sender_pipeline = optional_string(training, "sender-pipeline")?;
    if node_type == EdgeRole::Sender && sender_pipeline.is_none() {
        return Err(ServiceError::invalid(
            "training sender requires 'sender-pipeline'",
        ));
    }

    let mut transfer_data = Vec::new();
    if let Some(data) = training.get("transfer-data") {
        for (name, value) in as_object(data, "transfer-data")? {
            // Inline pipeline objects are kept as their JSON text; the
            // receiver re-parses them on arrival.
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            transfer_data.push((name.clone(), text));
        }
    }
    if node_type == EdgeRole::Sender && transfer_data.is_empty() {
        return Err(ServiceError::invalid(
            "training sender requires a non-empty 'transfer-data' table",
        ));
    }

    Ok(TrainingConfig {
        node_type,
        time_limit_s,
        sender_pipeline,
        transfer_data,
    })
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ServiceError::invalid(format!("'{what}' must be a JSON object")))
}

fn string_value(value: &Value, key: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ServiceError::invalid(format!("'{key}' must be a string")))
}

fn optional_string(object: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    object.get(key).map(|v| string_value(v, key)).transpose()
}

fn required_string(object: &Map<String, Value>, key: &str, context: &str) -> Result<String> {
    optional_string(object, key)?
        .ok_or_else(|| ServiceError::invalid(format!("'{context}' is missing '{key}'")))
}

fn optional_port(object: &Map<String, Value>, key: &str) -> Result<Option<u16>> {
    match object.get(key) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| ServiceError::invalid(format!("'{key}' is not a valid port"))),
        Some(Value::String(s)) => s
            .parse::<u16>()
            .map(Some)
            .map_err(|_| ServiceError::invalid(format!("'{key}' is not a valid port"))),
        Some(_) => Err(ServiceError::invalid(format!("'{key}' is not a valid port"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_with_direct_models() {
        let config = ServiceConfig::parse(
            r#"{
              "single": {
                "model": "/models/a.tflite, /models/b.tflite",
                "framework": "tensorflow-lite",
                "input_info": { "type": "float32", "dimension": "1:1:1:1" },
                "output_info": { "type": "float32", "dimension": "1:1:1:1" }
              },
              "information": { "timeout": "100", "threshold": "0.5" }
            }"#,
        )
        .unwrap();

        let VariantConfig::Single(single) = config.variant else {
            panic!("expected a single variant");
        };
        assert_eq!(single.models.len(), 2);
        assert_eq!(single.framework.as_deref(), Some("tensorflow-lite"));
        let info = single.input_info.unwrap();
        assert_eq!(info.tensor(0).unwrap().dimension[..4], [1, 1, 1, 1]);
        assert_eq!(
            config.information,
            vec![
                ("timeout".to_string(), "100".to_string()),
                ("threshold".to_string(), "0.5".to_string())
            ]
        );
    }

    #[test]
    fn single_requires_key_or_model() {
        assert!(ServiceConfig::parse(r#"{ "single": { "framework": "x" } }"#).is_err());
    }

    #[test]
    fn pipeline_nodes_accept_object_or_array() {
        let config = ServiceConfig::parse(
            r#"{
              "pipeline": {
                "description": "appsrc name=input_img ! sink name=result_clf",
                "input_node": { "name": "input_img", "info": { "type": "uint8", "dimension": "3:224:224:1" } },
                "output_node": [ { "name": "result_clf", "info": { "type": "uint8", "dimension": "1001:1" } } ]
              }
            }"#,
        )
        .unwrap();

        let VariantConfig::Pipeline(pipe) = config.variant else {
            panic!("expected a pipeline variant");
        };
        assert_eq!(pipe.input_nodes[0].name, "input_img");
        assert_eq!(pipe.output_nodes[0].name, "result_clf");
    }

    #[test]
    fn pipeline_requires_both_node_lists() {
        let err = ServiceConfig::parse(
            r#"{ "pipeline": { "description": "a ! b",
                 "input_node": { "name": "in", "info": { "type": "uint8", "dimension": "1" } } } }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn offloading_sender_requires_destination() {
        let err = ServiceConfig::parse(
            r#"{ "offloading": { "node-type": "sender", "connect-type": "TCP" } }"#,
        );
        assert!(err.is_err());

        let config = ServiceConfig::parse(
            r#"{
              "offloading": {
                "node-type": "sender",
                "dest-host": "127.0.0.1",
                "dest-port": 4420,
                "connect-type": "TCP",
                "topic": "t"
              },
              "services": {
                "model_registration": {
                  "service-type": "model_raw",
                  "service-key": "mobilenet",
                  "activate": "true"
                }
              }
            }"#,
        )
        .unwrap();
        let VariantConfig::Offloading(off) = config.variant else {
            panic!("expected an offloading variant");
        };
        assert_eq!(off.dest_port, Some(4420));
        let (key, desc) = &off.services[0];
        assert_eq!(key, "model_registration");
        assert_eq!(desc.service_type, OffloadServiceType::ModelRaw);
        assert!(desc.activate);
    }

    #[test]
    fn descriptor_accepts_json_string_form() {
        let desc = parse_service_descriptor(
            "k",
            &Value::String(r#"{ "service-type": "reply", "service-key": "rk" }"#.to_string()),
        )
        .unwrap();
        assert_eq!(desc.service_type, OffloadServiceType::Reply);
        assert_eq!(desc.service_key, "rk");
    }

    #[test]
    fn training_defaults_and_requirements() {
        let config = ServiceConfig::parse(
            r#"{
              "offloading": {
                "node-type": "receiver",
                "training": {
                  "node-type": "receiver",
                  "time-limit": 1,
                  "transfer-data": {}
                }
              }
            }"#,
        )
        .unwrap();
        let VariantConfig::Offloading(off) = config.variant else {
            panic!("expected an offloading variant");
        };
        let training = off.training.unwrap();
        assert_eq!(training.time_limit_s, 1);

        // A training sender without its pipeline template is invalid.
        let err = ServiceConfig::parse(
            r#"{
              "offloading": {
                "node-type": "sender",
                "dest-host": "h", "dest-port": 1, "connect-type": "TCP", "topic": "t",
                "training": { "node-type": "sender", "transfer-data": { "m": "/tmp/x" } }
              }
            }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn unknown_variant_is_rejected() {
        assert!(ServiceConfig::parse(r#"{ "other": {} }"#).is_err());
        assert!(ServiceConfig::parse("not json").is_err());
    }

    #[test]
    fn bad_dimension_strings_are_rejected() {
        assert!(parse_dimension("1:2:x").is_err());
        assert_eq!(parse_dimension("3:224:224:1").unwrap(), [3, 224, 224, 1]);
    }
}
