#![cfg(feature = "test_live")]

//! Tests against the real exchange. These need API_KEY and SECRET_KEY
//! in .env and will sign real requests.

use gridbot::exchange::coinbase::Coinbase;
use gridbot::exchange::Exchange;
use gridbot::shutdown::StopToken;
use gridbot::utils::config::Config;

fn live_config() -> Config {
    dotenv::dotenv().ok();
    let _ = env_logger::builder().is_test(true).try_init();

    Config {
        api_key: std::env::var("API_KEY").ok(),
        secret_key: std::env::var("SECRET_KEY").ok(),
        ..Config::default()
    }
}

#[tokio::test]
async fn connect_measures_a_sane_clock_adjustment() {
    let config = live_config();
    let stop = StopToken::new();

    let coinbase = Coinbase::connect(&config, stop.child()).await.unwrap();
    let adjustment = coinbase.time_adjustment();
    assert!(adjustment.abs() < chrono::Duration::seconds(60));
}

#[tokio::test]
async fn products_include_spot_markets() {
    let config = live_config();
    let stop = StopToken::new();

    let coinbase = Coinbase::connect(&config, stop.child()).await.unwrap();
    let products = coinbase.get_products().await.unwrap();
    assert!(products.iter().any(|p| p.product_id == "BTC-USD"));
}
