//! Construction of the status request sent every cycle.

use crate::client::config::RequestSource;
use crate::error::{Error, Result};
use crate::message::{Identity, NodeMatcher, StatusRequest, StringMatch};

/// Build the request from its configured source.
///
/// Templates are YAML documents in the shape of [`StatusRequest`]; JSON, being
/// YAML, works too. Without a template the request asks for the status of
/// `identity` itself.
pub async fn load(source: &RequestSource, identity: Identity) -> Result<StatusRequest> {
    match source {
        RequestSource::File(path) => {
            let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::RequestParse(format!("cannot read {}: {e}", path.display()))
            })?;
            parse(&text)
        }
        RequestSource::Literal(text) => parse(text),
        RequestSource::Synthesized => Ok(synthesize(identity)),
    }
}

/// Parse a YAML or JSON request template.
pub fn parse(text: &str) -> Result<StatusRequest> {
    serde_yaml::from_str(text).map_err(|e| Error::RequestParse(e.to_string()))
}

/// A request for the status of `identity`, presented as the caller too.
pub fn synthesize(identity: Identity) -> StatusRequest {
    let matcher = NodeMatcher {
        node_id: Some(StringMatch::Exact(identity.id.clone())),
        node_metadatas: Vec::new(),
    };
    StatusRequest {
        node: Some(identity),
        node_matchers: vec![matcher],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MetadataMatch;

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.json");
        std::fs::write(
            &path,
            r#"{"node": {"id": "caller", "cluster": "ops"},
                "node_matchers": [{"node_id": {"suffix": "-canary"}}]}"#,
        )
        .unwrap();

        let request = load(&RequestSource::File(path), Identity::new("ignored"))
            .await
            .unwrap();
        assert_eq!(request.node.unwrap().cluster, "ops");
        assert_eq!(
            request.node_matchers[0].node_id,
            Some(StringMatch::Suffix("-canary".to_string()))
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_parse_error() {
        let source = RequestSource::File("/nonexistent/request.json".into());
        let err = load(&source, Identity::default()).await.unwrap_err();
        assert!(matches!(err, Error::RequestParse(_)));
    }

    #[tokio::test]
    async fn test_synthesized_request() {
        let request = load(&RequestSource::Synthesized, Identity::new("me"))
            .await
            .unwrap();
        assert_eq!(request.node.as_ref().map(|n| n.id.as_str()), Some("me"));
        assert_eq!(
            request.node_matchers,
            vec![NodeMatcher {
                node_id: Some(StringMatch::Exact("me".to_string())),
                node_metadatas: vec![],
            }]
        );
    }

    #[test]
    fn test_parse_metadata_matchers() {
        let request = parse(
            r#"{"node_matchers": [{"node_metadatas": [
                {"path": ["TRAFFICDIRECTOR_NETWORK_NAME"], "value": {"exact": "default"}}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(
            request.node_matchers[0].node_metadatas,
            vec![MetadataMatch {
                path: vec!["TRAFFICDIRECTOR_NETWORK_NAME".to_string()],
                value: StringMatch::Exact("default".to_string()),
            }]
        );
    }

    #[test]
    fn test_parse_yaml_template() {
        let template = r#"
node:
  id: caller
  cluster: ops
node_matchers:
  - node_id:
      exact: node-1
    node_metadatas:
      - path: [NETWORK]
        value:
          prefix: prod
"#;
        let request = parse(template).unwrap();
        assert_eq!(request.node.unwrap().id, "caller");
        assert_eq!(
            request.node_matchers[0].node_id,
            Some(StringMatch::Exact("node-1".to_string()))
        );
        assert_eq!(
            request.node_matchers[0].node_metadatas[0].value,
            StringMatch::Prefix("prod".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_bad_templates() {
        for text in [
            r#"{"node_matchers": [], "extra": 1}"#,
            r#"{"node_matchers": {"node_id": {"exact": "a"}}}"#,
            r#"{"node_matchers": [{"node_id": {"exact": "a", "prefix": "b"}}]}"#,
            r#"{"node_matchers": [{"node_id": {"glob": "a*"}}]}"#,
            "just a string",
            "node_matchers: [",
        ] {
            let err = parse(text).unwrap_err();
            assert!(matches!(err, Error::RequestParse(_)), "{text}");
        }
    }
}
