//! Unit tests for the cloud load balancer client
//!
//! Tests request signing, response parsing, and error classification.

use portico_core::config::ElbConfig;
use portico_core::elb::{AlbClient, ElbClient, LoadBalancerApi};
use portico_core::error::PorticoError;
use wiremock::matchers::{body_string_contains, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DESCRIBE_RESPONSE: &str = r#"<DescribeInstanceHealthResponse>
  <DescribeInstanceHealthResult>
    <InstanceStates>
      <member><InstanceId>i-1</InstanceId><State>InService</State></member>
      <member><InstanceId>i-2</InstanceId><State>OutOfService</State></member>
    </InstanceStates>
  </DescribeInstanceHealthResult>
</DescribeInstanceHealthResponse>"#;

const TARGET_HEALTH_RESPONSE: &str = r#"<DescribeTargetHealthResponse>
  <DescribeTargetHealthResult>
    <TargetHealthDescriptions>
      <member>
        <Target><Id>i-1</Id><Port>8080</Port></Target>
        <TargetHealth><State>healthy</State></TargetHealth>
      </member>
      <member>
        <Target><Id>i-2</Id><Port>8080</Port></Target>
        <TargetHealth><State>draining</State></TargetHealth>
      </member>
    </TargetHealthDescriptions>
  </DescribeTargetHealthResult>
  <ResponseMetadata><RequestId>5f2e</RequestId></ResponseMetadata>
</DescribeTargetHealthResponse>"#;

const TARGET_GROUP: &str = "arn:aws:elasticloadbalancing:us-east-1:123456789012:targetgroup/web/73e2d6bc24d8a067";

fn config(endpoint: String) -> ElbConfig {
    ElbConfig {
        aws_access_key_id: Some("AKIDEXAMPLE".into()),
        aws_access_key_secret: Some("secret".into()),
        aws_endpoint: Some(endpoint),
        ..Default::default()
    }
}

fn client(server: &MockServer) -> ElbClient {
    ElbClient::new(&config(server.uri())).unwrap()
}

fn alb_client(server: &MockServer) -> AlbClient {
    AlbClient::new(&config(server.uri())).unwrap()
}

#[tokio::test]
async fn test_describe_parses_instances() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-date"))
        .and(body_string_contains("Action=DescribeInstanceHealth"))
        .and(body_string_contains("LoadBalancerName=public"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DESCRIBE_RESPONSE))
        .mount(&server)
        .await;

    let instances = client(&server).describe_instances("public").await.unwrap();
    assert_eq!(instances.into_iter().collect::<Vec<_>>(), vec!["i-1", "i-2"]);
}

#[tokio::test]
async fn test_register_sends_members() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=RegisterInstancesWithLoadBalancer"))
        .and(body_string_contains("Instances.member.1.InstanceId=i-7"))
        .and(body_string_contains("Instances.member.2.InstanceId=i-8"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<RegisterInstancesWithLoadBalancerResponse/>"))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .register_instances("public", &["i-7".into(), "i-8".into()])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_change_makes_no_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client(&server);
    client.register_instances("public", &[]).await.unwrap();
    client.deregister_instances("public", &[]).await.unwrap();
}

#[tokio::test]
async fn test_error_classification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("LoadBalancerName=throttled"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<ErrorResponse><Error><Code>Throttling</Code><Message>Rate exceeded</Message></Error></ErrorResponse>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("LoadBalancerName=missing"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<ErrorResponse><Error><Code>LoadBalancerNotFound</Code><Message>No such LB</Message></Error></ErrorResponse>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("LoadBalancerName=broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client(&server);

    let throttled = client.describe_instances("throttled").await.unwrap_err();
    assert!(matches!(throttled, PorticoError::Throttled { .. }));
    assert!(throttled.is_retryable());

    let missing = client.describe_instances("missing").await.unwrap_err();
    assert!(!missing.is_retryable());
    assert!(missing.to_string().contains("LoadBalancerNotFound"));

    let broken = client.describe_instances("broken").await.unwrap_err();
    assert!(matches!(broken, PorticoError::LoadBalancerUnavailable { status: 503, .. }));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_retryable() {
    let client = ElbClient::new(&config("http://127.0.0.1:1".into())).unwrap();

    let err = client.describe_instances("public").await.unwrap_err();
    assert!(matches!(err, PorticoError::LoadBalancerUnreachable { .. }), "{:?}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_target_health_parses_target_ids() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("authorization"))
        .and(body_string_contains("Action=DescribeTargetHealth"))
        .and(body_string_contains("Version=2015-12-01"))
        .and(body_string_contains("TargetGroupArn=arn%3Aaws%3Aelasticloadbalancing"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TARGET_HEALTH_RESPONSE))
        .mount(&server)
        .await;

    let targets = alb_client(&server).describe_instances(TARGET_GROUP).await.unwrap();
    assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["i-1", "i-2"]);
}

#[tokio::test]
async fn test_target_registration_sends_members() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=RegisterTargets"))
        .and(body_string_contains("Targets.member.1.Id=i-7"))
        .and(body_string_contains("Targets.member.2.Id=i-8"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<RegisterTargetsResponse/>"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("Action=DeregisterTargets"))
        .and(body_string_contains("Targets.member.1.Id=i-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<DeregisterTargetsResponse/>"))
        .expect(1)
        .mount(&server)
        .await;

    let client = alb_client(&server);
    client
        .register_instances(TARGET_GROUP, &["i-7".into(), "i-8".into()])
        .await
        .unwrap();
    client.deregister_instances(TARGET_GROUP, &["i-1".into()]).await.unwrap();
    client.deregister_instances(TARGET_GROUP, &[]).await.unwrap();
}

#[tokio::test]
async fn test_unknown_target_group_is_not_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<ErrorResponse><Error><Code>TargetGroupNotFound</Code><Message>One or more target groups not found</Message></Error></ErrorResponse>",
        ))
        .mount(&server)
        .await;

    let err = alb_client(&server).describe_instances(TARGET_GROUP).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("TargetGroupNotFound"));
    assert!(err.to_string().contains(TARGET_GROUP));
}
