//! Offline handling of AppService manifests for `render` and `check`.

use anyhow::{anyhow, Context, Result};
use keel_core::AppService;
use keel_engine::{synthesize, EngineConfig};
use keel_kubehub::convert;
use kube::api::DynamicObject;

/// Parse one AppService manifest (YAML or JSON). `default_ns` fills a missing namespace.
pub fn parse_record(text: &str, default_ns: &str) -> Result<AppService> {
    let mut obj: DynamicObject = serde_yaml::from_str(text).context("parsing manifest")?;
    if let Some(types) = &obj.types {
        if types.kind != keel_core::KIND {
            return Err(anyhow!("expected kind {}, found {}", keel_core::KIND, types.kind));
        }
    }
    if obj.metadata.namespace.is_none() {
        obj.metadata.namespace = Some(default_ns.to_string());
    }
    Ok(convert::record_from_dynamic(&obj)?)
}

/// Synthesized dependents as cluster manifests, workload first.
pub fn render(record: &AppService, cfg: &EngineConfig) -> Result<Vec<serde_json::Value>> {
    let desired = synthesize(record, cfg);
    let mut deployment = convert::deployment_from_workload(&desired.workload);
    deployment.metadata.resource_version = None;
    let mut service = convert::service_from_endpoint(&desired.endpoint);
    service.metadata.resource_version = None;
    Ok(vec![
        with_types(convert::to_manifest(&deployment)?, "apps/v1", "Deployment"),
        with_types(convert::to_manifest(&service)?, "v1", "Service"),
    ])
}

fn with_types(mut v: serde_json::Value, api_version: &str, kind: &str) -> serde_json::Value {
    if let Some(obj) = v.as_object_mut() {
        obj.insert("apiVersion".into(), api_version.into());
        obj.insert("kind".into(), kind.into());
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_kubehub::KindRegistry;

    const WEB: &str = r#"
apiVersion: example.com/v1alpha1
kind: AppService
metadata:
  name: web
spec:
  replicas: 2
  image: nginx:1.25
  port: 8080
  environment:
    MODE: prod
  resources:
    cpu: 250m
"#;

    #[test]
    fn parses_and_defaults_namespace() {
        let rec = parse_record(WEB, "staging").unwrap();
        assert_eq!(rec.key().to_string(), "staging/web");
        assert_eq!(rec.spec.replicas, 2);
        assert!(rec.spec.validate().is_ok());
    }

    #[test]
    fn undecodable_spec_parses_but_fails_check() {
        let text = WEB.replace("replicas: 2", "replicas: three");
        let rec = parse_record(&text, "default").unwrap();
        let err = rec.validate().unwrap_err();
        assert!(err.problems[0].contains("could not be decoded"), "{:?}", err.problems);
    }

    #[test]
    fn rejects_other_kinds() {
        let text = WEB.replace("kind: AppService", "kind: Deployment");
        assert!(parse_record(&text, "default").is_err());
    }

    #[test]
    fn renders_deployment_then_service() {
        let rec = parse_record(WEB, "default").unwrap();
        let out = render(&rec, &EngineConfig::default()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["kind"], "Deployment");
        assert_eq!(out[0]["spec"]["replicas"], 2);
        assert_eq!(out[0]["spec"]["selector"]["matchLabels"]["app"], "web");
        assert_eq!(out[0]["metadata"]["ownerReferences"][0]["apiVersion"], KindRegistry::standard().record().api_version);
        let c = &out[0]["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(c["image"], "nginx:1.25");
        assert_eq!(c["resources"]["limits"]["cpu"], "250m");
        assert_eq!(out[1]["kind"], "Service");
        assert_eq!(out[1]["spec"]["type"], "ClusterIP");
        assert_eq!(out[1]["spec"]["ports"][0]["targetPort"], 8080);
    }
}
