//! End-to-end ingestion pipeline behavior: dedup, claim semantics,
//! deferred materialization, and determinism across equivalent snapshots.

#![forbid(unsafe_code)]

use serde_json::{json, Value};

use tiller_config::Config;
use tiller_core::{CONFIG_ANNOTATION, GATEWAY_API_VERSION, INGRESS_CONTROLLER};
use tiller_fetch::ResourceFetcher;

fn mapping(name: &str, prefix: &str, service: &str) -> Value {
    json!({
        "kind": "Mapping",
        "apiVersion": GATEWAY_API_VERSION,
        "metadata": {"name": name, "namespace": "default"},
        "spec": {"prefix": prefix, "service": service},
    })
}

fn run(objects: &[Value]) -> (ResourceFetcher, Config) {
    let mut fetcher = ResourceFetcher::new().unwrap();
    let mut aconf = Config::new();
    fetcher.parse_object_list(&mut aconf, objects);
    fetcher.finalize(&mut aconf);
    (fetcher, aconf)
}

#[test]
fn duplicate_objects_are_processed_once() {
    let m = mapping("foo", "/foo/", "foo-svc");
    let (fetcher, aconf) = run(&[m.clone(), m.clone(), m]);

    assert_eq!(fetcher.sorted().len(), 1);
    assert!(aconf.errors().is_empty());
}

#[test]
fn unknown_kinds_are_skipped_without_errors() {
    let (fetcher, aconf) = run(&[json!({
        "kind": "ConfigMap",
        "apiVersion": "v1",
        "metadata": {"name": "not-ours", "namespace": "default"},
        "data": {"x": "y"},
    })]);

    assert!(fetcher.sorted().is_empty());
    assert!(aconf.errors().is_empty());
}

#[test]
fn malformed_spec_is_still_claimed() {
    // A recognized kind with a mangled spec must not fall through to
    // another handler; the error lands on its rkey instead.
    let (fetcher, aconf) = run(&[json!({
        "kind": "Mapping",
        "apiVersion": GATEWAY_API_VERSION,
        "metadata": {"name": "broken", "namespace": "default"},
        "spec": "not an object",
    })]);

    assert!(fetcher.sorted().is_empty());
    assert!(aconf.has_errors("broken.default"));
}

#[test]
fn annotations_materialize_at_finalize() {
    let annotated_service = json!({
        "kind": "Service",
        "apiVersion": "v1",
        "metadata": {
            "name": "carrier",
            "namespace": "default",
            "annotations": {
                CONFIG_ANNOTATION:
                    "---\napiVersion: gateway.tiller.dev/v1\nkind: Mapping\nname: annotated\nprefix: /ann/\nservice: ann-svc\n",
            },
        },
        "spec": {"ports": [{"port": 80}]},
    });

    let mut fetcher = ResourceFetcher::new().unwrap();
    let mut aconf = Config::new();
    fetcher.parse_object_list(&mut aconf, &[annotated_service]);

    // Nothing is emitted until the scan ends.
    assert!(fetcher.sorted().is_empty());

    fetcher.finalize(&mut aconf);
    let sorted = fetcher.sorted();
    let kinds: Vec<&str> = sorted.iter().map(|r| r.kind()).collect();
    assert_eq!(kinds, vec!["Mapping", "Service"]);
    assert_eq!(sorted[0].rkey, "annotated.default");
    assert_eq!(sorted[0].get_str("service"), Some("ann-svc"));
}

#[test]
fn finalize_is_idempotent() {
    let mut fetcher = ResourceFetcher::new().unwrap();
    let mut aconf = Config::new();
    fetcher.parse_object_list(
        &mut aconf,
        &[json!({
            "kind": "Service",
            "apiVersion": "v1",
            "metadata": {"name": "svc", "namespace": "default"},
            "spec": {"ports": [{"port": 80}]},
        })],
    );

    fetcher.finalize(&mut aconf);
    fetcher.finalize(&mut aconf);

    // A second finalize must not re-emit the deferred Services.
    assert_eq!(fetcher.sorted().len(), 1);
}

#[test]
fn bad_annotation_yaml_blames_the_carrier() {
    let (fetcher, aconf) = run(&[json!({
        "kind": "Service",
        "apiVersion": "v1",
        "metadata": {
            "name": "carrier",
            "namespace": "default",
            "annotations": {CONFIG_ANNOTATION: "kind: [unterminated"},
        },
        "spec": {"ports": [{"port": 80}]},
    })]);

    assert!(aconf.has_errors("carrier.default"));
    // The carrier Service itself still gets through.
    assert_eq!(fetcher.sorted().len(), 1);
}

#[test]
fn ingress_conversion_waits_for_services_and_classes() {
    // Deliberately scrambled: the Ingress arrives before the IngressClass
    // that claims it and the Service whose named port it references.
    let objects = vec![
        json!({
            "kind": "Ingress",
            "apiVersion": "networking.k8s.io/v1",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "ingressClassName": "tiller",
                "rules": [{
                    "host": "web.example.com",
                    "http": {"paths": [{
                        "path": "/web/",
                        "backend": {"service": {"name": "web-svc", "port": {"name": "http"}}},
                    }]},
                }],
            },
        }),
        json!({
            "kind": "IngressClass",
            "apiVersion": "networking.k8s.io/v1",
            "metadata": {"name": "tiller"},
            "spec": {"controller": INGRESS_CONTROLLER},
        }),
        json!({
            "kind": "Service",
            "apiVersion": "v1",
            "metadata": {"name": "web-svc", "namespace": "default"},
            "spec": {"ports": [{"name": "http", "port": 8080}]},
        }),
    ];

    let (fetcher, aconf) = run(&objects);
    assert!(aconf.errors().is_empty());

    let sorted = fetcher.sorted();
    let m = sorted.iter().find(|r| r.kind() == "Mapping").unwrap();
    assert_eq!(m.rkey, "web-0-0.default");
    assert_eq!(m.get_str("prefix"), Some("/web/"));
    assert_eq!(m.get_str("service"), Some("web-svc.default:8080"));
    assert_eq!(m.get_str("host"), Some("web.example.com"));
}

#[test]
fn ingress_for_another_class_is_ignored() {
    let (fetcher, aconf) = run(&[json!({
        "kind": "Ingress",
        "apiVersion": "networking.k8s.io/v1",
        "metadata": {"name": "other", "namespace": "default"},
        "spec": {
            "ingressClassName": "nginx",
            "rules": [{"http": {"paths": [{
                "path": "/x/",
                "backend": {"service": {"name": "x", "port": {"number": 80}}},
            }]}}],
        },
    })]);

    assert!(fetcher.sorted().is_empty());
    assert!(aconf.errors().is_empty());
}

#[test]
fn equivalent_snapshots_sort_identically() {
    let objects = vec![
        mapping("zulu", "/z/", "z-svc"),
        mapping("alpha", "/a/", "a-svc"),
        json!({
            "kind": "Service",
            "apiVersion": "v1",
            "metadata": {"name": "mid", "namespace": "default"},
            "spec": {"ports": [{"port": 80}]},
        }),
        json!({
            "kind": "Host",
            "apiVersion": GATEWAY_API_VERSION,
            "metadata": {"name": "site", "namespace": "default"},
            "spec": {"hostname": "site.example.com"},
        }),
    ];

    let serialize = |objs: &[Value]| {
        let (fetcher, aconf) = run(objs);
        assert!(aconf.errors().is_empty());
        serde_json::to_string(&fetcher.sorted()).unwrap()
    };

    let baseline = serialize(&objects);
    let mut reversed = objects.clone();
    reversed.reverse();
    assert_eq!(serialize(&reversed), baseline);

    let rotated: Vec<Value> = objects[2..]
        .iter()
        .chain(&objects[..2])
        .cloned()
        .collect();
    assert_eq!(serialize(&rotated), baseline);
}

#[test]
fn snapshot_bundle_walk_and_deltas() {
    let snapshot = json!({
        "Kubernetes": {
            "Mapping": [mapping("foo", "/foo/", "foo-svc")],
            "Service": [{
                "kind": "Service",
                "apiVersion": "v1",
                "metadata": {"name": "foo-svc", "namespace": "default"},
                "spec": {"ports": [{"port": 80}]},
            }],
            "Host": null,
        },
        "Deltas": [{
            "kind": "Mapping",
            "apiVersion": GATEWAY_API_VERSION,
            "metadata": {"name": "foo", "namespace": "default"},
            "deltaType": "add",
        }],
        "Invalid": [{
            "kind": "Mapping",
            "apiVersion": GATEWAY_API_VERSION,
            "metadata": {"name": "rejected", "namespace": "default"},
            "errors": "spec.service in body is required",
        }],
    });

    let mut fetcher = ResourceFetcher::new().unwrap();
    let mut aconf = Config::new();
    fetcher.parse_snapshot_str(&mut aconf, &snapshot.to_string());
    fetcher.finalize(&mut aconf);

    assert_eq!(fetcher.deltas().len(), 1);
    assert_eq!(fetcher.deltas()[0].kind, "Mapping");
    assert!(aconf.has_errors("rejected.default"));

    // The invalid Mapping rejoins its kind bucket and walks the pipeline
    // like any other object; its error detail stays on its rkey.
    let elements = fetcher.sorted();
    let keys: Vec<(String, String)> = elements
        .iter()
        .map(|r| (r.kind().to_string(), r.rkey.clone()))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("Mapping".into(), "foo.default".into()),
            ("Mapping".into(), "rejected.default".into()),
            ("Service".into(), "foo-svc.default".into()),
        ]
    );
}

#[test]
fn unparseable_snapshot_is_a_global_error() {
    let mut fetcher = ResourceFetcher::new().unwrap();
    let mut aconf = Config::new();
    fetcher.parse_snapshot_str(&mut aconf, "{not json");

    assert!(aconf.has_errors(tiller_config::GLOBAL_RKEY));
}
