use assert_matches::assert_matches;
use chrono::TimeZone;
use serde_json::json;

use super::*;
use crate::jq::Expression;

fn headers(items: &[(&str, &str)]) -> HeaderMap {
	let mut h = HeaderMap::new();
	for (k, v) in items {
		h.insert(
			http::HeaderName::try_from(*k).unwrap(),
			http::HeaderValue::try_from(*v).unwrap(),
		);
	}
	h
}

fn body_selector(expr: &str) -> Selector {
	Selector::Body(Expression::compile(expr, &[]).unwrap())
}

#[test]
fn unpaginated_request_has_one_page() {
	let mut p = Paginator::new(None);
	assert_eq!(p.first(), PageParams::default());
	let next = p.advance(&HeaderMap::new(), &json!({})).unwrap();
	assert!(next.is_none());
}

#[test]
fn integer_increment_stops_on_request_param() {
	let config = Arc::new(PaginationConfig {
		next_page_url: None,
		params: vec![Param {
			name: "offset".to_string(),
			location: Location::Query,
			kind: Kind::Int {
				start: 0,
				increment: 1,
			},
		}],
		stop_on: vec![StopCondition::RequestParam {
			param: "offset".to_string(),
			compare: Compare::Gte,
			value: json!(2),
		}],
	});
	let mut p = Paginator::new(Some(config));
	assert_eq!(p.first().query, vec![("offset".to_string(), "0".to_string())]);
	let page2 = p.advance(&HeaderMap::new(), &json!({})).unwrap().unwrap();
	assert_eq!(page2.query, vec![("offset".to_string(), "1".to_string())]);
	// offset reaches 2 and the loop halts before issuing it
	assert!(p.advance(&HeaderMap::new(), &json!({})).unwrap().is_none());
	assert_eq!(p.page_num(), 2);
}

#[test]
fn dynamic_body_and_header_params() {
	let config = Arc::new(PaginationConfig {
		next_page_url: None,
		params: vec![
			Param {
				name: "token_body".to_string(),
				location: Location::Query,
				kind: Kind::Dynamic {
					source: body_selector(".nextToken"),
				},
			},
			Param {
				name: "token_header".to_string(),
				location: Location::Header,
				kind: Kind::Dynamic {
					source: Selector::Header("X-Next-Token".to_string()),
				},
			},
		],
		stop_on: vec![StopCondition::ResponseBody(
			Expression::compile(".nextToken == null", &[]).unwrap(),
		)],
	});
	let mut p = Paginator::new(Some(config));

	// First page carries nothing: no dynamic value extracted yet
	let first = p.first();
	assert!(first.query.is_empty());
	assert!(first.headers.is_empty());

	let page2 = p
		.advance(
			&headers(&[("X-Next-Token", "xyz789")]),
			&json!({"nextToken": "abc123"}),
		)
		.unwrap()
		.unwrap();
	assert_eq!(
		page2.query,
		vec![("token_body".to_string(), "abc123".to_string())]
	);
	assert_eq!(
		page2.headers,
		vec![("token_header".to_string(), "xyz789".to_string())]
	);

	let page3 = p
		.advance(
			&headers(&[("X-Next-Token", "uvw000")]),
			&json!({"nextToken": "def456"}),
		)
		.unwrap()
		.unwrap();
	assert_eq!(
		page3.query,
		vec![("token_body".to_string(), "def456".to_string())]
	);

	// Terminal page: body token null, stop condition fires
	assert!(
		p.advance(&HeaderMap::new(), &json!({"nextToken": null}))
			.unwrap()
			.is_none()
	);
	assert_eq!(p.page_num(), 3);
}

#[test]
fn page_num_zero_stops_after_one_page() {
	let config = Arc::new(PaginationConfig {
		next_page_url: None,
		params: vec![],
		stop_on: vec![StopCondition::PageNum(0)],
	});
	let mut p = Paginator::new(Some(config));
	p.first();
	assert!(p.advance(&HeaderMap::new(), &json!({})).unwrap().is_none());
}

#[test]
fn page_num_n_stops_after_n_pages() {
	let config = Arc::new(PaginationConfig {
		next_page_url: None,
		params: vec![],
		stop_on: vec![StopCondition::PageNum(3)],
	});
	let mut p = Paginator::new(Some(config));
	p.first();
	assert!(p.advance(&HeaderMap::new(), &json!({})).unwrap().is_some());
	assert!(p.advance(&HeaderMap::new(), &json!({})).unwrap().is_some());
	assert!(p.advance(&HeaderMap::new(), &json!({})).unwrap().is_none());
	assert_eq!(p.page_num(), 3);
}

#[test]
fn next_page_url_from_body() {
	let config = Arc::new(PaginationConfig {
		next_page_url: Some(body_selector(".links.next")),
		params: vec![],
		stop_on: vec![],
	});
	let mut p = Paginator::new(Some(config));
	p.first();
	let page2 = p
		.advance(
			&HeaderMap::new(),
			&json!({"links": {"next": "https://ex/items?page=2"}}),
		)
		.unwrap()
		.unwrap();
	assert_eq!(
		page2.next_page_url.as_deref(),
		Some("https://ex/items?page=2")
	);
	assert!(
		p.advance(&HeaderMap::new(), &json!({"links": {"next": null}}))
			.unwrap()
			.is_none()
	);
}

#[test]
fn next_page_url_from_header() {
	let config = Arc::new(PaginationConfig {
		next_page_url: Some(Selector::Header("Link-Next".to_string())),
		params: vec![],
		stop_on: vec![],
	});
	let mut p = Paginator::new(Some(config));
	p.first();
	let page2 = p
		.advance(&headers(&[("Link-Next", "https://ex/p2")]), &json!({}))
		.unwrap()
		.unwrap();
	assert_eq!(page2.next_page_url.as_deref(), Some("https://ex/p2"));
	assert!(p.advance(&HeaderMap::new(), &json!({})).unwrap().is_none());
}

#[test]
fn datetime_increment_formats_with_config() {
	let start = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
	let config = Arc::new(PaginationConfig {
		next_page_url: None,
		params: vec![Param {
			name: "day".to_string(),
			location: Location::Query,
			kind: Kind::Datetime {
				start: Some(start),
				increment: TimeDelta::hours(24),
				format: Some("%Y-%m-%d".to_string()),
			},
		}],
		stop_on: vec![StopCondition::PageNum(2)],
	});
	let mut p = Paginator::new(Some(config));
	assert_eq!(p.first().query, vec![("day".to_string(), "2024-03-01".to_string())]);
	let page2 = p.advance(&HeaderMap::new(), &json!({})).unwrap().unwrap();
	assert_eq!(page2.query, vec![("day".to_string(), "2024-03-02".to_string())]);
	assert!(p.advance(&HeaderMap::new(), &json!({})).unwrap().is_none());
}

#[test]
fn body_params_keep_json_types() {
	let config = Arc::new(PaginationConfig {
		next_page_url: None,
		params: vec![Param {
			name: "cursor".to_string(),
			location: Location::Body,
			kind: Kind::Dynamic {
				source: body_selector(".cursor"),
			},
		}],
		stop_on: vec![StopCondition::PageNum(5)],
	});
	let mut p = Paginator::new(Some(config));
	p.first();
	let page2 = p
		.advance(&HeaderMap::new(), &json!({"cursor": {"after": 10}}))
		.unwrap()
		.unwrap();
	assert_eq!(page2.body.get("cursor"), Some(&json!({"after": 10})));
}

#[test]
fn dynamic_ordering_comparison_requires_numbers() {
	let state = State::Dynamic(json!("abc"));
	assert_matches!(
		compare_param(&state, Compare::Gte, &json!(2)),
		Err(Error::Parse(_))
	);
	assert_matches!(compare_param(&state, Compare::Eq, &json!("abc")), Ok(true));
	let numeric = State::Dynamic(json!("15"));
	assert_matches!(compare_param(&numeric, Compare::Gt, &json!(9)), Ok(true));
}
