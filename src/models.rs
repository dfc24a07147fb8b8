// Model repositories and images. A repository is a named, ordered
// collection of versioned model images belonging to one project. Metadata
// lives server-side; the payload is an opaque byte blob tagged with the
// name of the codec that produced it, and is only fetched when asked for.

use std::any::Any;
use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::unsync::OnceCell;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::project::Project;

// Metadata keys the platform reserves for bookkeeping.
const KEY_ID: &str = "Model-Id";
const KEY_NAME: &str = "Model-Name";
const KEY_VERSION: &str = "Model-Version";
const KEY_SERIALIZER: &str = "Serializer";
const KEY_COMMENT: &str = "Comment";

/// A named collection of model images within one project.
pub struct ModelRepository<'a> {
    project: &'a Project,
    pub name: String,
}

impl<'a> ModelRepository<'a> {
    pub fn new(project: &'a Project, name: impl Into<String>) -> ModelRepository<'a> {
        ModelRepository {
            project,
            name: name.into(),
        }
    }

    /// Fetches one image by version or tag; `None` selects the latest.
    pub fn get_image(
        &self,
        version: Option<i64>,
        tag: Option<&str>,
    ) -> Result<Option<ModelImage<'a>>> {
        let mut params = json!({
            "project": self.project.name,
            "name": self.name,
        });
        if let Some(version) = version {
            params["version"] = version.into();
        }
        if let Some(tag) = tag {
            params["tag"] = tag.into();
        }
        let response = self.project.client().call("get_model_version", params)?;
        if response.is_null() {
            return Ok(None);
        }
        ModelImage::from_metadata(self.project, &response).map(Some)
    }

    /// Creates a new, not-yet-saved image from a model object. The first
    /// codec in the registry that recognizes the object wins; its name is
    /// recorded alongside the payload.
    pub fn new_image(
        &self,
        model: &dyn Any,
        metadata: BTreeMap<String, String>,
        codecs: &CodecRegistry,
    ) -> Result<ModelImage<'a>> {
        let (payload, codec) = codecs.encode(model)?;
        let cell = OnceCell::new();
        let _ = cell.set(payload);
        Ok(ModelImage {
            project: self.project,
            name: self.name.clone(),
            version: None,
            id: None,
            codec: Some(codec.to_string()),
            comment: None,
            metadata,
            payload: cell,
        })
    }
}

/// One immutable, versioned snapshot of a model: metadata plus a lazily
/// fetched payload. `id` is assigned by the server on first save; once it
/// is set the image can never be saved again.
pub struct ModelImage<'a> {
    project: &'a Project,
    pub name: String,
    pub version: Option<i64>,
    id: Option<String>,
    codec: Option<String>,
    comment: Option<String>,
    metadata: BTreeMap<String, String>,
    payload: OnceCell<Vec<u8>>,
}

impl<'a> ModelImage<'a> {
    /// Builds an image from a server-side metadata object (as returned by
    /// `get_model_version` and `get_activity`).
    pub fn from_metadata(project: &'a Project, value: &Value) -> Result<ModelImage<'a>> {
        let object = value.as_object().ok_or_else(|| {
            ClientError::Remote(format!("expected model metadata object, got {value}"))
        })?;
        let name = object
            .get(KEY_NAME)
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Remote("model metadata has no name".into()))?
            .to_string();

        let mut metadata = BTreeMap::new();
        for (key, val) in object {
            if matches!(
                key.as_str(),
                KEY_ID | KEY_NAME | KEY_VERSION | KEY_SERIALIZER | KEY_COMMENT
            ) {
                continue;
            }
            metadata.insert(key.clone(), plain_string(val));
        }

        Ok(ModelImage {
            project,
            name,
            version: object.get(KEY_VERSION).and_then(Value::as_i64),
            id: object
                .get(KEY_ID)
                .and_then(Value::as_str)
                .map(str::to_string),
            codec: object
                .get(KEY_SERIALIZER)
                .and_then(Value::as_str)
                .map(str::to_string),
            comment: object
                .get(KEY_COMMENT)
                .and_then(Value::as_str)
                .map(str::to_string),
            metadata,
            payload: OnceCell::new(),
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn codec(&self) -> Option<&str> {
        self.codec.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// The serialized model bytes, fetched from the server on first
    /// access and cached for the lifetime of the image.
    pub fn payload(&self) -> Result<&[u8]> {
        self.payload
            .get_or_try_init(|| {
                debug!(name = %self.name, version = ?self.version, "fetching model payload");
                let mut params = json!({
                    "project": self.project.name,
                    "name": self.name,
                    "include_payload": true,
                });
                if let Some(version) = self.version {
                    params["version"] = version.into();
                }
                let response = self.project.client().call("get_model_version", params)?;
                let encoded = response
                    .get("payload")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ClientError::Remote("model version has no payload".into())
                    })?;
                BASE64.decode(encoded).map_err(|e| {
                    ClientError::Remote(format!("model payload is not valid base64: {e}"))
                })
            })
            .map(Vec::as_slice)
    }

    /// Saves this image as a new version in its repository.
    ///
    /// Panics if the image was already saved: an image with an id is
    /// immutable, and calling `save` again is a bug in the caller, not an
    /// operational failure.
    pub fn save(&mut self, comment: &str) -> Result<()> {
        assert!(
            self.id.is_none(),
            "a model image cannot be modified once saved"
        );
        let payload = self.payload.get().ok_or_else(|| {
            ClientError::Config("model image has no payload to save".into())
        })?;
        let response = self.project.client().call(
            "save_model",
            json!({
                "project": self.project.name,
                "name": self.name,
                "metadata": self.metadata,
                "payload": BASE64.encode(payload),
                "serializer": self.codec,
                "comment": comment,
            }),
        )?;
        self.id = response
            .get(KEY_ID)
            .and_then(Value::as_str)
            .map(str::to_string);
        self.version = response.get(KEY_VERSION).and_then(Value::as_i64);
        self.comment = Some(comment.to_string());
        Ok(())
    }

    /// One-line rendering for `models:log`.
    pub fn summary(&self) -> String {
        let version = self
            .version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unsaved".into());
        format!(
            "{}:{}  {}  {}",
            self.name,
            version,
            self.id.as_deref().unwrap_or("-"),
            self.comment.as_deref().unwrap_or("")
        )
        .trim_end()
        .to_string()
    }
}

impl std::fmt::Display for ModelImage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = &self.id {
            writeln!(f, "{KEY_ID}: {id}")?;
        }
        writeln!(f, "{KEY_NAME}: {}", self.name)?;
        if let Some(version) = self.version {
            writeln!(f, "{KEY_VERSION}: {version}")?;
        }
        if let Some(codec) = &self.codec {
            writeln!(f, "{KEY_SERIALIZER}: {codec}")?;
        }
        for (key, value) in &self.metadata {
            writeln!(f, "{key}: {value}")?;
        }
        if let Some(comment) = &self.comment {
            writeln!(f, "{KEY_COMMENT}: {comment}")?;
        }
        Ok(())
    }
}

fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses a `name[:version-or-tag]` model reference: a numeric suffix is a
/// version, anything else a tag.
pub fn parse_model_ref(reference: &str) -> (String, Option<i64>, Option<String>) {
    match reference.split_once(':') {
        Some((name, suffix)) => match suffix.parse::<i64>() {
            Ok(version) => (name.to_string(), Some(version), None),
            Err(_) => (name.to_string(), None, Some(suffix.to_string())),
        },
        None => (reference.to_string(), None, None),
    }
}

/// Turns a model object into payload bytes and back. Implementations are
/// asked in registration order whether they recognize the object; the
/// first one that does produces the payload and names the codec tag.
pub trait Codec {
    fn name(&self) -> &'static str;
    fn can_encode(&self, model: &dyn Any) -> bool;
    fn encode(&self, model: &dyn Any) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any>>;
}

/// Ordered list of codecs, tried in sequence.
pub struct CodecRegistry {
    codecs: Vec<Box<dyn Codec>>,
}

impl CodecRegistry {
    /// The built-in codecs: JSON values first, raw bytes as the fallback.
    pub fn builtin() -> CodecRegistry {
        CodecRegistry {
            codecs: vec![Box::new(JsonCodec), Box::new(BytesCodec)],
        }
    }

    pub fn empty() -> CodecRegistry {
        CodecRegistry { codecs: Vec::new() }
    }

    /// Appends a codec. Order matters: earlier codecs win ties.
    pub fn register(&mut self, codec: Box<dyn Codec>) {
        self.codecs.push(codec);
    }

    /// Encodes with the first codec that recognizes the object.
    pub fn encode(&self, model: &dyn Any) -> Result<(Vec<u8>, &'static str)> {
        for codec in &self.codecs {
            if codec.can_encode(model) {
                return Ok((codec.encode(model)?, codec.name()));
            }
        }
        Err(ClientError::Config(
            "no registered codec can serialize this model".into(),
        ))
    }

    /// Decodes bytes produced by the codec named `name`.
    pub fn decode(&self, name: &str, bytes: &[u8]) -> Result<Box<dyn Any>> {
        let codec = self
            .codecs
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| ClientError::Config(format!("unknown codec {name:?}")))?;
        codec.decode(bytes)
    }
}

/// Serializes `serde_json::Value` models.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn can_encode(&self, model: &dyn Any) -> bool {
        model.is::<Value>()
    }

    fn encode(&self, model: &dyn Any) -> Result<Vec<u8>> {
        let value = model
            .downcast_ref::<Value>()
            .expect("can_encode vetted the type");
        serde_json::to_vec(value)
            .map_err(|e| ClientError::Config(format!("cannot serialize model: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any>> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ClientError::Config(format!("cannot deserialize model: {e}")))?;
        Ok(Box::new(value))
    }
}

/// Passes pre-serialized `Vec<u8>` models through untouched.
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn can_encode(&self, model: &dyn Any) -> bool {
        model.is::<Vec<u8>>()
    }

    fn encode(&self, model: &dyn Any) -> Result<Vec<u8>> {
        Ok(model
            .downcast_ref::<Vec<u8>>()
            .expect("can_encode vetted the type")
            .clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any>> {
        Ok(Box::new(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Client;

    fn offline_project() -> Project {
        // Port 9 is not listening; any accidental RPC would fail loudly.
        Project::with_client(
            "test-project",
            None,
            Client::with_credentials("http://127.0.0.1:9", None),
        )
    }

    #[test]
    fn image_parses_reserved_and_free_metadata() {
        let project = offline_project();
        let image = ModelImage::from_metadata(
            &project,
            &json!({
                "Model-Id": "m-123",
                "Model-Name": "churn",
                "Model-Version": 4,
                "Serializer": "json",
                "Comment": "weekly retrain",
                "Accuracy": "0.92",
            }),
        )
        .unwrap();
        assert_eq!(image.id(), Some("m-123"));
        assert_eq!(image.name, "churn");
        assert_eq!(image.version, Some(4));
        assert_eq!(image.codec(), Some("json"));
        assert_eq!(image.get("Accuracy"), Some("0.92"));
        assert_eq!(image.summary(), "churn:4  m-123  weekly retrain");
    }

    #[test]
    #[should_panic(expected = "cannot be modified once saved")]
    fn saving_a_saved_image_panics_before_any_rpc() {
        let project = offline_project();
        let mut image = ModelImage::from_metadata(
            &project,
            &json!({"Model-Id": "m-1", "Model-Name": "churn", "Model-Version": 1}),
        )
        .unwrap();
        let _ = image.save("second save");
    }

    #[test]
    fn new_image_records_the_winning_codec() {
        let project = offline_project();
        let repo = ModelRepository::new(&project, "churn");
        let model = json!({"weights": [1, 2, 3]});
        let image = repo
            .new_image(&model, BTreeMap::new(), &CodecRegistry::builtin())
            .unwrap();
        assert_eq!(image.codec(), Some("json"));
        assert_eq!(image.id(), None);
        // The payload is available locally without any fetch.
        let decoded: Value = serde_json::from_slice(image.payload().unwrap()).unwrap();
        assert_eq!(decoded, model);
    }

    #[test]
    fn registry_tries_codecs_in_registration_order() {
        struct Greedy(&'static str);
        impl Codec for Greedy {
            fn name(&self) -> &'static str {
                self.0
            }
            fn can_encode(&self, _model: &dyn Any) -> bool {
                true
            }
            fn encode(&self, _model: &dyn Any) -> Result<Vec<u8>> {
                Ok(self.0.as_bytes().to_vec())
            }
            fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any>> {
                Ok(Box::new(bytes.to_vec()))
            }
        }

        let mut registry = CodecRegistry::empty();
        registry.register(Box::new(Greedy("first")));
        registry.register(Box::new(Greedy("second")));
        let (payload, name) = registry.encode(&()).unwrap();
        assert_eq!(name, "first");
        assert_eq!(payload, b"first");
    }

    #[test]
    fn unrecognized_model_is_rejected() {
        let registry = CodecRegistry::builtin();
        let err = registry.encode(&12u32).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn bytes_codec_is_the_fallback_for_raw_payloads() {
        let registry = CodecRegistry::builtin();
        let model: Vec<u8> = vec![0xde, 0xad];
        let (payload, name) = registry.encode(&model).unwrap();
        assert_eq!(name, "bytes");
        assert_eq!(payload, model);
    }

    #[test]
    fn decode_dispatches_by_codec_tag() {
        let registry = CodecRegistry::builtin();
        let decoded = registry.decode("json", b"{\"a\": 1}").unwrap();
        assert_eq!(
            decoded.downcast_ref::<Value>().unwrap(),
            &json!({"a": 1})
        );
        assert!(registry.decode("joblib", b"").is_err());
    }

    #[test]
    fn model_ref_splits_into_version_or_tag() {
        assert_eq!(parse_model_ref("churn"), ("churn".into(), None, None));
        assert_eq!(
            parse_model_ref("churn:7"),
            ("churn".into(), Some(7), None)
        );
        assert_eq!(
            parse_model_ref("churn:latest"),
            ("churn".into(), None, Some("latest".into()))
        );
    }
}
