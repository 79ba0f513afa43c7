use std::path::Path;

use certify::config::Config;
use certify::runner::{plan, Outcome, Report, Runner};
use certify::suites::{csi_test_suites, define_test_suite};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"))?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Driver scripts call kubectl, which only knows about the environment.
    if let Some(path) = &config.kubeconfig {
        std::env::set_var("KUBECONFIG", path);
    }

    let suites = csi_test_suites();
    let mut drivers = Vec::with_capacity(config.drivers.len());
    for source in &config.drivers {
        let driver = source.load().await?;
        let cases = define_test_suite(driver.as_ref(), &suites);
        info!(
            driver = %driver.driver_info().name,
            cases = cases.len(),
            "Expanded test suites"
        );
        drivers.push((driver, cases));
    }

    let mut report = Report::default();
    if config.dry_run {
        for (driver, cases) in &drivers {
            report.merge(plan(driver.as_ref(), cases, &config.filter));
        }
        for result in &report.results {
            match &result.outcome {
                Outcome::Skipped(reason) => println!("[Skip] {}: {}", result.name, reason),
                _ => println!("[Run] {}", result.name),
            }
        }
        println!(
            "{} of {} cases would run",
            report.passed(),
            report.results.len() + report.filtered
        );
        return Ok(());
    }

    let client = kube_client(config.kubeconfig.as_deref()).await?;
    for (driver, cases) in drivers {
        let runner = Runner::new(
            client.clone(),
            driver,
            config.manifests.clone(),
            config.filter.clone(),
        );
        report.merge(runner.run(&cases).await);
    }
    println!("{}", report);
    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn kube_client(kubeconfig: Option<&Path>) -> anyhow::Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default()).await?
        }
        None => kube::Config::infer().await?,
    };
    Ok(kube::Client::try_from(config)?)
}
