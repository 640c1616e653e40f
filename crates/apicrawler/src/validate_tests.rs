use serde_json::json;

use super::*;

fn parse(input: &str) -> LocalManifest {
	serde_yaml::from_str(input).unwrap()
}

fn locations(input: &str) -> Vec<String> {
	validate(&parse(input))
		.into_iter()
		.map(|d| d.location)
		.collect()
}

#[test]
fn valid_manifest_has_no_diagnostics() {
	let diags = validate(&parse(
		r#"
rootContext: []
stream: true
steps:
  - type: request
    name: list
    request:
      url: https://ex/items
      method: GET
"#,
	));
	assert!(diags.is_empty(), "unexpected: {diags:?}");
}

#[test]
fn root_context_shape() {
	assert!(locations("rootContext: 7\nsteps: []").contains(&"rootContext".to_string()));
	assert!(locations("steps: []").contains(&"rootContext".to_string()));
}

#[test]
fn stream_requires_sequence_root() {
	let locs = locations(
		r#"
rootContext: {}
stream: true
steps:
  - type: request
    name: a
    request: {url: "https://ex", method: GET}
"#,
	);
	assert!(locs.contains(&"stream".to_string()));
}

#[test]
fn steps_must_not_be_empty() {
	assert!(locations("rootContext: {}").contains(&"steps".to_string()));
}

#[test]
fn step_type_and_name_required() {
	let locs = locations(
		r#"
rootContext: {}
steps:
  - path: ".x"
"#,
	);
	assert!(locs.contains(&"steps.0.type".to_string()));
	assert!(locs.contains(&"steps.0.name".to_string()));
}

#[test]
fn for_each_requires_as_and_one_source() {
	let locs = locations(
		r#"
rootContext: {}
steps:
  - type: forEach
    name: loop
"#,
	);
	assert!(locs.contains(&"steps.0.as".to_string()));
	assert!(locs.contains(&"steps.0".to_string()));

	let both = locations(
		r#"
rootContext: {}
steps:
  - type: forEach
    name: loop
    as: x
    path: ".a"
    values: [1]
"#,
	);
	assert!(both.contains(&"steps.0".to_string()));
}

#[test]
fn request_method_and_url() {
	let locs = locations(
		r#"
rootContext: {}
steps:
  - type: request
    name: r
    request:
      url: ""
      method: DELETE
"#,
	);
	assert!(locs.contains(&"steps.0.request.url".to_string()));
	assert!(locs.contains(&"steps.0.request.method".to_string()));
}

#[test]
fn post_with_body_needs_content_type() {
	let locs = locations(
		r#"
rootContext: {}
steps:
  - type: request
    name: r
    request:
      url: https://ex
      method: POST
      body: {a: 1}
"#,
	);
	assert!(locs.contains(&"steps.0.request.contentType".to_string()));

	let with_header = locations(
		r#"
rootContext: {}
steps:
  - type: request
    name: r
    request:
      url: https://ex
      method: POST
      headers:
        CONTENT-TYPE: application/json
      body: {a: 1}
"#,
	);
	assert!(!with_header.contains(&"steps.0.request.contentType".to_string()));
}

#[test]
fn pagination_needs_selector_or_params_with_stops() {
	let locs = locations(
		r#"
rootContext: {}
steps:
  - type: request
    name: r
    request:
      url: https://ex
      method: GET
      pagination: {}
"#,
	);
	assert!(locs.contains(&"steps.0.request.pagination".to_string()));
	assert!(locs.contains(&"steps.0.request.pagination.stopOn".to_string()));
}

#[test]
fn pagination_param_fields() {
	let locs = locations(
		r#"
rootContext: {}
steps:
  - type: request
    name: r
    request:
      url: https://ex
      method: GET
      pagination:
        params:
          - name: cursor
            location: path
            type: dynamic
        stopOn:
          - type: pageNum
            value: -3
"#,
	);
	assert!(locs.contains(&"steps.0.request.pagination.params.0.location".to_string()));
	assert!(locs.contains(&"steps.0.request.pagination.params.0.source".to_string()));
	assert!(locs.contains(&"steps.0.request.pagination.stopOn.0.value".to_string()));
}

#[test]
fn stop_condition_fields() {
	let locs = locations(
		r#"
rootContext: {}
steps:
  - type: request
    name: r
    request:
      url: https://ex
      method: GET
      pagination:
        params:
          - name: offset
            location: query
            type: int
        stopOn:
          - type: requestParam
            param: offset
            compare: between
            value: 2
"#,
	);
	assert!(locs.contains(&"steps.0.request.pagination.stopOn.0.compare".to_string()));
}

#[test]
fn merge_directives_are_exclusive() {
	let locs = locations(
		r#"
rootContext: {}
steps:
  - type: request
    name: r
    noopMerge: true
    mergeOn: "."
    request:
      url: https://ex
      method: GET
"#,
	);
	assert!(locs.contains(&"steps.0.noopMerge".to_string()));

	let two = locations(
		r#"
rootContext: {}
steps:
  - type: request
    name: r
    mergeOn: "."
    mergeWithParentOn: "."
    request:
      url: https://ex
      method: GET
"#,
	);
	assert!(two.contains(&"steps.0".to_string()));
}

#[test]
fn auth_required_fields_by_type() {
	let locs = locations(
		r#"
rootContext: {}
auth:
  type: basic
steps:
  - type: request
    name: r
    request: {url: "https://ex", method: GET}
"#,
	);
	assert!(locs.contains(&"auth.username".to_string()));
	assert!(locs.contains(&"auth.password".to_string()));

	let oauth = locations(
		r#"
rootContext: {}
auth:
  type: oauth2
  method: clientCredentials
  clientId: id
steps:
  - type: request
    name: r
    request: {url: "https://ex", method: GET}
"#,
	);
	assert!(oauth.contains(&"auth.tokenUrl".to_string()));
	assert!(oauth.contains(&"auth.clientSecret".to_string()));

	let custom = locations(
		r#"
rootContext: {}
auth:
  type: custom
  extractFrom: header
  extractSelector: x-token
  injectInto: query
  loginRequest:
    url: https://ex/login
    method: POST
steps:
  - type: request
    name: r
    request: {url: "https://ex", method: GET}
"#,
	);
	assert!(custom.contains(&"auth.injectKey".to_string()));
}

#[test]
fn nested_steps_are_validated() {
	let locs = locations(
		r#"
rootContext: {}
steps:
  - type: request
    name: outer
    request: {url: "https://ex", method: GET}
    steps:
      - type: forEach
        name: inner
        path: ".x"
"#,
	);
	assert!(locs.contains(&"steps.0.steps.0.as".to_string()));
}

#[test]
fn diagnostics_render_with_locations() {
	let d = Diagnostic {
		location: "steps.0.type".to_string(),
		message: "required".to_string(),
	};
	assert_eq!(d.to_string(), "steps.0.type: required");
	assert_eq!(render(&[d]), "  steps.0.type: required");
}

#[test]
fn request_step_rejects_for_each_fields() {
	let m = LocalManifest {
		root_context: Some(json!({})),
		auth: None,
		headers: Default::default(),
		stream: false,
		steps: vec![LocalStep {
			step_type: Some("request".to_string()),
			name: Some("r".to_string()),
			path: Some(".a".to_string()),
			bind_as: None,
			values: None,
			steps: Vec::new(),
			request: Some(LocalRequest {
				url: Some("https://ex".to_string()),
				method: Some("GET".to_string()),
				headers: Default::default(),
				content_type: None,
				body: None,
				pagination: None,
				auth: None,
			}),
			result_transformer: None,
			merge_on: None,
			merge_with_parent_on: None,
			merge_with_context: None,
			noop_merge: false,
			parallel: false,
			max_concurrency: None,
			rate_limit: None,
		}],
	};
	let locs: Vec<_> = validate(&m).into_iter().map(|d| d.location).collect();
	assert!(locs.contains(&"steps.0".to_string()));
}
