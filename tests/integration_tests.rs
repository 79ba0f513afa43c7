use certify::drivers::driver_by_name;
use certify::framework::{Framework, NAMESPACE_PREFIX};
use certify::manifest::ManifestSource;
use certify::runner::{CaseFilter, Outcome, Report, Runner};
use certify::suites::{csi_test_suites, define_test_suite};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;

fn in_cluster_environment() -> bool {
    std::env::var("CSI_CERTIFY_TEST_ENV") == Ok("cluster".to_owned())
}

async fn run_driver(name: &str, focus: &str) -> anyhow::Result<Report> {
    let client = kube::Client::try_default().await?;
    let driver = driver_by_name(name).expect("driver should be registered");
    let cases = define_test_suite(driver.as_ref(), &csi_test_suites());
    let filter = CaseFilter::new(Some(focus), None)?;
    let runner = Runner::new(client, driver, ManifestSource::default(), filter);
    Ok(runner.run(&cases).await)
}

fn assert_passed(report: &Report) {
    for result in &report.results {
        if let Outcome::Failed(reason) = &result.outcome {
            panic!("{} failed: {}", result.name, reason);
        }
    }
    assert!(report.passed() > 0, "nothing ran:\n{}", report);
}

#[tokio::test]
async fn test_framework_namespace_lifecycle() -> anyhow::Result<()> {
    if !in_cluster_environment() {
        return Ok(());
    }
    let client = kube::Client::try_default().await?;
    let framework = Framework::setup(client.clone(), "lifecycle", ManifestSource::default()).await?;
    let namespace = framework.namespace().to_owned();
    assert!(namespace.starts_with(NAMESPACE_PREFIX));

    let namespaces: Api<Namespace> = Api::all(client);
    namespaces.get(&namespace).await?;

    framework.teardown().await;
    match namespaces.get(&namespace).await {
        // A terminating namespace is still visible for a while.
        Ok(ns) => assert!(ns.metadata.deletion_timestamp.is_some()),
        Err(kube::Error::Api(e)) => assert_eq!(e.code, 404),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[tokio::test]
async fn test_hostpath_provisions_with_defaults() -> anyhow::Result<()> {
    if !in_cluster_environment() {
        return Ok(());
    }
    let report = run_driver("hostpath", "provisioning should provision storage with defaults").await?;
    assert_passed(&report);
    Ok(())
}

#[tokio::test]
async fn test_hostpath_stores_data() -> anyhow::Result<()> {
    if !in_cluster_environment() {
        return Ok(());
    }
    let report = run_driver("hostpath", r"Dynamic PV \(default fs\)\] volumes should store data").await?;
    assert_passed(&report);
    Ok(())
}

#[tokio::test]
async fn test_nfs_preprovisioned_volumes() -> anyhow::Result<()> {
    if !in_cluster_environment() {
        return Ok(());
    }
    let report = run_driver("nfs", r"Pre-provisioned PV \(default fs\)\] volumes").await?;
    assert_passed(&report);
    Ok(())
}
