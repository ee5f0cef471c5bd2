use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metriq_query::{
    BatchLimits, ClientError, ClientFactory, DispatchConfig, ExecuteError, Executor,
    EXCEEDED_LIMIT_NOTICE, MAX_METRICS_EXCEEDED, QueryContext, QueryResult, QueryType,
    RegionFailurePolicy, RequestQuery, ResponseMessage,
};
use metriq_test::{MockClientFactory, echo_response, request_query, search_query, time_range};
use similar_asserts::assert_eq;
use tokio_util::sync::CancellationToken;

async fn execute(
    factory: &Arc<MockClientFactory>,
    dispatch: DispatchConfig,
    queries: Vec<RequestQuery>,
) -> Result<BTreeMap<String, QueryResult>, ExecuteError> {
    let client_factory: Arc<dyn ClientFactory> = factory.clone();
    let executor = Executor::new(client_factory, BatchLimits::default(), dispatch);

    let context = QueryContext {
        time_range: time_range(3),
        queries,
    };

    executor
        .query(QueryType::TimeSeries, context, &CancellationToken::new())
        .await
}

fn names(result: &QueryResult) -> Vec<&str> {
    result.series.iter().map(|s| s.name.as_str()).collect()
}

#[tokio::test]
async fn test_round_trip_across_regions() {
    metriq_test::setup();

    let factory = Arc::new(MockClientFactory::echo());
    let results = execute(
        &factory,
        DispatchConfig::default(),
        vec![
            request_query("A", "us-east-1", &["Maximum", "Average"]),
            request_query("B", "eu-west-1", &["Sum"]),
            search_query("C", "us-east-1"),
        ],
    )
    .await
    .unwrap();

    assert_eq!(results.keys().collect::<Vec<_>>(), vec!["A", "B", "C"]);
    assert!(results.values().all(|r| !r.is_error()));

    assert_eq!(
        names(&results["A"]),
        vec!["queryA_Average series", "queryA_Maximum series"]
    );
    assert_eq!(
        results["A"].meta.ids,
        vec!["queryA_Average", "queryA_Maximum"]
    );
    assert_eq!(names(&results["B"]), vec!["queryB series"]);

    insta::assert_snapshot!(
        results["C"].meta.search_expressions.join("\n"),
        @r#"REMOVE_EMPTY(SEARCH('{AWS/EC2,"InstanceId"} MetricName="CPUUtilization"', 'Average', 60))"#
    );

    let us = factory.requests_for("us-east-1");
    assert_eq!(us.len(), 1);
    assert_eq!(
        us[0].ids(),
        vec!["queryA_Maximum", "queryA_Average", "queryC"]
    );

    let eu = factory.requests_for("eu-west-1");
    assert_eq!(eu.len(), 1);
    assert_eq!(eu[0].ids(), vec!["queryB"]);
}

#[tokio::test]
async fn test_batches_split_at_entry_ceiling() {
    metriq_test::setup();

    let factory = Arc::new(MockClientFactory::echo());
    let queries = (0..101)
        .map(|n| request_query(&format!("R{n:03}"), "us-east-1", &["Average"]))
        .collect();

    let results = execute(&factory, DispatchConfig::default(), queries)
        .await
        .unwrap();
    assert_eq!(results.len(), 101);

    let requests = factory.requests();
    let sizes: Vec<_> = requests.iter().map(|r| r.request.entries.len()).collect();
    assert_eq!(sizes, vec![100, 1]);
    assert_eq!(requests[1].ids(), vec!["queryR100"]);
}

#[tokio::test]
async fn test_batches_split_at_search_ceiling() {
    metriq_test::setup();

    let factory = Arc::new(MockClientFactory::echo());
    let mut queries: Vec<_> = (0..7)
        .map(|n| search_query(&format!("S{n}"), "us-east-1"))
        .collect();
    queries.push(request_query("M", "us-east-1", &["Sum"]));

    execute(&factory, DispatchConfig::default(), queries)
        .await
        .unwrap();

    let requests = factory.requests();
    let ids: Vec<_> = requests.iter().map(|r| r.ids()).collect();
    assert_eq!(
        ids,
        vec![
            vec!["queryS0", "queryS1", "queryS2", "queryS3", "queryS4"],
            vec!["queryS5", "queryS6", "queryM"],
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_region_error_aborts_execution() {
    metriq_test::setup();

    let factory = MockClientFactory::new(|region, request| match region {
        "eu-west-1" => Err(ClientError::Rejected {
            code: "InvalidParameterValue".to_owned(),
            message: "bad period".to_owned(),
        }),
        _ => Ok(echo_response(request)),
    })
    .delay_region("us-east-1", Duration::from_secs(600));
    let factory = Arc::new(factory);

    let error = execute(
        &factory,
        DispatchConfig::default(),
        vec![
            request_query("A", "us-east-1", &["Average"]),
            request_query("B", "eu-west-1", &["Average"]),
        ],
    )
    .await
    .unwrap_err();

    let ExecuteError::Region(error) = &error else {
        panic!("unexpected error {error:?}");
    };
    assert_eq!(error.region, "eu-west-1");
}

#[tokio::test]
async fn test_region_error_isolated() {
    metriq_test::setup();

    let factory = MockClientFactory::new(|region, request| match region {
        "eu-west-1" => Err(ClientError::Throttled),
        _ => Ok(echo_response(request)),
    });
    let factory = Arc::new(factory);

    let dispatch = DispatchConfig {
        region_failure: RegionFailurePolicy::Isolate,
        ..Default::default()
    };
    let results = execute(
        &factory,
        dispatch,
        vec![
            request_query("A", "us-east-1", &["Average"]),
            request_query("B", "eu-west-1", &["Average"]),
        ],
    )
    .await
    .unwrap();

    assert_eq!(names(&results["A"]), vec!["queryA series"]);
    insta::assert_snapshot!(
        results["B"].error.as_deref().unwrap(),
        @"failed to query region eu-west-1: failed to send batch 1 of 1: request throttled by the remote api"
    );
}

#[tokio::test]
async fn test_input_errors_are_scoped() {
    metriq_test::setup();

    let factory = Arc::new(MockClientFactory::echo());

    let mut duplicate = request_query("B", "us-east-1", &["Sum"]);
    duplicate.id = Some("queryA".to_owned());

    let results = execute(
        &factory,
        DispatchConfig::default(),
        vec![request_query("A", "us-east-1", &["Sum"]), duplicate],
    )
    .await
    .unwrap();

    assert_eq!(names(&results["A"]), vec!["queryA series"]);
    insta::assert_snapshot!(
        results["B"].error.as_deref().unwrap(),
        @"error parsing query B, query id queryA is not unique"
    );

    let requests = factory.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].ids(), vec!["queryA"]);
}

#[tokio::test]
async fn test_exceeded_limit_notice() {
    metriq_test::setup();

    let factory = MockClientFactory::new(|_, request| {
        let mut response = echo_response(request);
        response.messages.push(ResponseMessage {
            code: MAX_METRICS_EXCEEDED.to_owned(),
            value: "Maximum number of allowed metrics exceeded".to_owned(),
        });
        Ok(response)
    });
    let factory = Arc::new(factory);

    let results = execute(
        &factory,
        DispatchConfig::default(),
        vec![search_query("A", "us-east-1")],
    )
    .await
    .unwrap();

    let result = &results["A"];
    assert!(!result.is_error());
    assert!(result.meta.exceeded_limit);
    assert_eq!(result.meta.notices, vec![EXCEEDED_LIMIT_NOTICE]);
}

#[tokio::test]
async fn test_all_regions_fail_setup() {
    metriq_test::setup();

    let factory = MockClientFactory::echo().fail_region("us-east-1");
    let factory = Arc::new(factory);

    let error = execute(
        &factory,
        DispatchConfig::default(),
        vec![request_query("A", "us-east-1", &["Average"])],
    )
    .await
    .unwrap_err();

    assert!(matches!(error, ExecuteError::NoViableRegion(_)));
    assert!(factory.requests().is_empty());
}
