use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use apicrawler::{Crawler, Error, Manifest};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Replays a fixed sequence of responses, one per hit.
struct Sequence {
	hits: AtomicUsize,
	responses: Vec<ResponseTemplate>,
}

impl Sequence {
	fn new(responses: Vec<ResponseTemplate>) -> Sequence {
		Sequence {
			hits: AtomicUsize::new(0),
			responses,
		}
	}
}

impl Respond for Sequence {
	fn respond(&self, _: &Request) -> ResponseTemplate {
		let i = self.hits.fetch_add(1, Ordering::SeqCst);
		self
			.responses
			.get(i)
			.cloned()
			.unwrap_or_else(|| ResponseTemplate::new(500))
	}
}

async fn run(manifest: &str) -> Value {
	let manifest = Manifest::from_yaml(manifest).unwrap();
	Crawler::new(manifest, reqwest::Client::new())
		.run(CancellationToken::new())
		.await
		.unwrap()
}

#[tokio::test]
async fn dynamic_pagination_threads_body_and_header_tokens() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/items"))
		.respond_with(Sequence::new(vec![
			ResponseTemplate::new(200)
				.insert_header("X-Next-Token", "xyz789")
				.set_body_json(json!({"nextToken": "abc123"})),
			ResponseTemplate::new(200)
				.insert_header("X-Next-Token", "uvw000")
				.set_body_json(json!({"nextToken": "def456"})),
			ResponseTemplate::new(200).set_body_json(json!({"nextToken": null})),
		]))
		.expect(3)
		.mount(&server)
		.await;

	run(&format!(
		r#"
rootContext: []
steps:
  - type: request
    name: pages
    noopMerge: true
    request:
      url: {}/items
      method: GET
      pagination:
        params:
          - name: token_body
            location: query
            type: dynamic
            source: "body:.nextToken"
          - name: token_header
            location: header
            type: dynamic
            source: "header:X-Next-Token"
        stopOn:
          - type: responseBody
            expression: ".nextToken == null"
"#,
		server.uri()
	))
	.await;

	let requests = server.received_requests().await.unwrap();
	assert_eq!(requests.len(), 3);
	assert_eq!(requests[0].url.query(), None);
	assert!(requests[0].headers.get("token_header").is_none());
	assert_eq!(requests[1].url.query(), Some("token_body=abc123"));
	assert_eq!(
		requests[1].headers.get("token_header").unwrap(),
		"xyz789"
	);
	assert_eq!(requests[2].url.query(), Some("token_body=def456"));
	assert_eq!(
		requests[2].headers.get("token_header").unwrap(),
		"uvw000"
	);
}

#[tokio::test]
async fn integer_offset_pagination_stops_before_the_limit() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/list"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": []})))
		.expect(2)
		.mount(&server)
		.await;

	run(&format!(
		r#"
rootContext: []
steps:
  - type: request
    name: list
    noopMerge: true
    request:
      url: {}/list
      method: GET
      pagination:
        params:
          - name: offset
            location: query
            type: int
            default: 0
            increment: 1
        stopOn:
          - type: requestParam
            param: offset
            compare: gte
            value: 2
"#,
		server.uri()
	))
	.await;

	let requests = server.received_requests().await.unwrap();
	let queries: Vec<_> = requests.iter().map(|r| r.url.query().unwrap()).collect();
	assert_eq!(queries, vec!["offset=0", "offset=1"]);
}

#[tokio::test]
async fn for_each_values_resolve_nested_url_templates() {
	let server = MockServer::start().await;
	for id in 1..=3 {
		Mock::given(method("GET"))
			.and(path(format!("/things/{id}")))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": id})))
			.expect(1)
			.mount(&server)
			.await;
	}

	let out = run(&format!(
		r#"
rootContext: []
steps:
  - type: forEach
    name: byId
    values: [1, 2, 3]
    as: id
    mergeOn: ". + $res"
    steps:
      - type: request
        name: thing
        request:
          url: "{}/things/{{{{ .id.value }}}}"
          method: GET
"#,
		server.uri()
	))
	.await;

	assert_eq!(
		out,
		json!([
			{"value": 1, "id": 1},
			{"value": 2, "id": 2},
			{"value": 3, "id": 3},
		])
	);
}

#[tokio::test]
async fn merge_with_context_targets_an_ancestor() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/facility"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"subs": [{"id": "s1", "loc": "locA"}, {"id": "s2", "loc": "locB"}]
		})))
		.mount(&server)
		.await;
	for (loc, name) in [("locA", "North"), ("locB", "South")] {
		Mock::given(method("GET"))
			.and(path(format!("/locations/{loc}")))
			.respond_with(
				ResponseTemplate::new(200).set_body_json(json!({"id": loc, "name": name})),
			)
			.mount(&server)
			.await;
	}

	let out = run(&format!(
		r#"
rootContext: {{}}
steps:
  - type: request
    name: facility
    as: facility
    request:
      url: {uri}/facility
      method: GET
    steps:
      - type: forEach
        name: subs
        path: ".subs"
        as: sub
        steps:
          - type: request
            name: location
            request:
              url: "{uri}/locations/{{{{ .sub.loc }}}}"
              method: GET
            mergeWithContext:
              name: sub
              rule: ".locationDetails = (.locationDetails // {{}}) + {{($res.id): $res}}"
"#,
		uri = server.uri()
	))
	.await;

	assert_eq!(
		out["subs"][0]["locationDetails"]["locA"],
		json!({"id": "locA", "name": "North"})
	);
	assert_eq!(
		out["subs"][1]["locationDetails"]["locB"],
		json!({"id": "locB", "name": "South"})
	);
}

#[tokio::test]
async fn streaming_emits_records_and_resets_the_root() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/records"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!(["a", "b", "c"])))
		.mount(&server)
		.await;

	let yaml = format!(
		r#"
rootContext: []
stream: true
steps:
  - type: request
    name: records
    request:
      url: {}/records
      method: GET
"#,
		server.uri()
	);

	let manifest = Manifest::from_yaml(&yaml).unwrap();
	let crawler = Crawler::new(manifest, reqwest::Client::new());
	let (mut rx, crawl) = crawler.run_streaming(CancellationToken::new(), 16);
	let collect = async {
		let mut records = Vec::new();
		while let Some(r) = rx.recv().await {
			records.push(r);
		}
		records
	};
	let (aggregate, records) = tokio::join!(crawl, collect);
	assert_eq!(records, vec![json!("a"), json!("b"), json!("c")]);
	assert_eq!(aggregate.unwrap(), json!([]));

	// Streaming preserves aggregation identity: without a stream consumer
	// the same manifest aggregates the same records.
	let aggregated = run(&yaml).await;
	assert_eq!(aggregated, Value::Array(records));
}

#[tokio::test]
async fn shared_cookie_authenticator_logs_in_once() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/login"))
		.respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "sid=abc123; Path=/"))
		.expect(1)
		.mount(&server)
		.await;
	for endpoint in ["a", "b", "c"] {
		Mock::given(method("GET"))
			.and(path(format!("/{endpoint}")))
			.and(header("cookie", "sid=abc123"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({endpoint: true})))
			.expect(1)
			.mount(&server)
			.await;
	}

	let out = run(&format!(
		r#"
rootContext: {{}}
auth:
  type: cookie
  extractSelector: sid
  onePerRun: true
  loginRequest:
    url: {uri}/login
    method: POST
steps:
  - type: request
    name: a
    request: {{url: "{uri}/a", method: GET}}
  - type: request
    name: b
    request: {{url: "{uri}/b", method: GET}}
  - type: request
    name: c
    request: {{url: "{uri}/c", method: GET}}
"#,
		uri = server.uri()
	))
	.await;

	assert_eq!(out, json!({"a": true, "b": true, "c": true}));
}

#[tokio::test]
async fn unpaginated_request_issues_exactly_one_page() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/one"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"n": 1})))
		.expect(1)
		.mount(&server)
		.await;

	let out = run(&format!(
		r#"
rootContext: {{}}
steps:
  - type: request
    name: one
    request: {{url: "{}/one", method: GET}}
"#,
		server.uri()
	))
	.await;
	assert_eq!(out, json!({"n": 1}));
}

#[tokio::test]
async fn non_2xx_responses_are_not_errors() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/flaky"))
		.respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "busy"})))
		.mount(&server)
		.await;

	let out = run(&format!(
		r#"
rootContext: {{}}
steps:
  - type: request
    name: flaky
    request: {{url: "{}/flaky", method: GET}}
"#,
		server.uri()
	))
	.await;
	assert_eq!(out, json!({"error": "busy"}));
}

#[tokio::test]
async fn cancellation_before_any_call_emits_nothing() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
		.mount(&server)
		.await;

	let manifest = Manifest::from_yaml(&format!(
		r#"
rootContext: []
stream: true
steps:
  - type: request
    name: never
    request: {{url: "{}/never", method: GET}}
"#,
		server.uri()
	))
	.unwrap();
	let crawler = Crawler::new(manifest, reqwest::Client::new());
	let cancel = CancellationToken::new();
	cancel.cancel();
	let (mut rx, crawl) = crawler.run_streaming(cancel, 16);
	let (result, first) = tokio::join!(crawl, async { rx.recv().await });
	assert!(matches!(result, Err(Error::Cancelled)));
	assert_eq!(first, None);
	assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn parallel_iterations_aggregate_in_index_order() {
	let server = MockServer::start().await;
	// Earlier items respond slower, so completion order inverts issue order
	for (i, delay) in [(1, 120u64), (2, 80), (3, 40), (4, 0)] {
		Mock::given(method("GET"))
			.and(path(format!("/slow/{i}")))
			.respond_with(
				ResponseTemplate::new(200)
					.set_delay(Duration::from_millis(delay))
					.set_body_json(json!({"i": i})),
			)
			.mount(&server)
			.await;
	}

	let out = run(&format!(
		r#"
rootContext: []
steps:
  - type: forEach
    name: fan
    values: [1, 2, 3, 4]
    as: n
    parallel: true
    maxConcurrency: 4
    mergeOn: ". + $res"
    steps:
      - type: request
        name: slow
        request:
          url: "{}/slow/{{{{ .n.value }}}}"
          method: GET
"#,
		server.uri()
	))
	.await;

	let ids: Vec<_> = out
		.as_array()
		.unwrap()
		.iter()
		.map(|v| v["i"].as_i64().unwrap())
		.collect();
	assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn post_body_merges_paginator_params_and_templates() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/search"))
		.respond_with(Sequence::new(vec![
			ResponseTemplate::new(200).set_body_json(json!({"cursor": "c2", "rows": [1]})),
			ResponseTemplate::new(200).set_body_json(json!({"cursor": null, "rows": []})),
		]))
		.expect(2)
		.mount(&server)
		.await;

	run(&format!(
		r#"
rootContext: {{}}
headers:
  X-Tenant: acme
steps:
  - type: request
    name: search
    noopMerge: true
    request:
      url: {uri}/search
      method: POST
      contentType: application/json
      body:
        q: "term"
      pagination:
        params:
          - name: cursor
            location: body
            type: dynamic
            source: "body:.cursor"
        stopOn:
          - type: responseBody
            expression: ".cursor == null"
"#,
		uri = server.uri()
	))
	.await;

	let requests = server.received_requests().await.unwrap();
	assert_eq!(requests.len(), 2);
	let first: Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert_eq!(first, json!({"q": "term"}));
	let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
	assert_eq!(second, json!({"q": "term", "cursor": "c2"}));
	assert_eq!(
		requests[0].headers.get("content-type").unwrap(),
		"application/json"
	);
	assert_eq!(requests[0].headers.get("x-tenant").unwrap(), "acme");
}
