use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

const HEADER: &str = "type,priority,from,to,amount,currency,enterprise,user,expires_in_secs";

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("settlement-queue"));
    cmd.arg("tests/fixtures/requests.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "id,type,priority,status,amount,currency,fee,retry_count,last_error",
        ))
        // Two payments share a batch below the first discount tier
        .stdout(predicate::str::contains(",payment,normal,submitted,100,XRP,10,0,"))
        .stdout(predicate::str::contains(",payment,normal,submitted,250.5,XRP,10,0,"))
        // Wallet setup goes alone at 15 x 1.5
        .stdout(predicate::str::contains(",wallet_setup,high,submitted,20,XRP,23,0,"))
        .stderr(predicate::str::contains("queue drained"));

    Ok(())
}

#[test]
fn test_cli_network_load_raises_fees() {
    let mut cmd = Command::new(cargo_bin!("settlement-queue"));
    cmd.arg("tests/fixtures/requests.csv")
        .arg("--network-load")
        .arg("0.5");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(",payment,normal,submitted,100,XRP,15,0,"));
}

#[test]
fn test_cli_rejected_destination_exhausts_retries() {
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "{}", HEADER).unwrap();
    writeln!(csv, "payment,critical,rAlice,rBlocked,5,XRP,enterprise-1,user-1,").unwrap();

    let mut cmd = Command::new(cargo_bin!("settlement-queue"));
    cmd.arg(csv.path()).arg("--reject-address").arg("rBlocked");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(",payment,critical,failed,5,XRP,"))
        .stdout(predicate::str::contains("Retries exhausted after 3 attempts"));
}

#[test]
fn test_cli_config_file() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, r#"{{"retry": {{"max_retries": 1}}}}"#).unwrap();
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "{}", HEADER).unwrap();
    writeln!(csv, "payment,low,rAlice,rBlocked,5,XRP,enterprise-1,user-1,").unwrap();

    let mut cmd = Command::new(cargo_bin!("settlement-queue"));
    cmd.arg(csv.path())
        .arg("--config")
        .arg(config.path())
        .arg("--reject-address")
        .arg("rBlocked");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Retries exhausted after 1 attempts"));
}

#[test]
fn test_cli_invalid_config_fails() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, r#"{{"fees": {{"base_fee_floor": "100", "max_fee": "50"}}}}"#).unwrap();

    let mut cmd = Command::new(cargo_bin!("settlement-queue"));
    cmd.arg("tests/fixtures/requests.csv")
        .arg("--config")
        .arg(config.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("base_fee_floor"));
}

#[test]
fn test_cli_missing_input_fails() {
    let mut cmd = Command::new(cargo_bin!("settlement-queue"));
    cmd.arg("tests/fixtures/does_not_exist.csv");
    cmd.assert().failure();
}
