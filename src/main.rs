use log::{info, warn};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use gpio_edge::{AppConfig, AppState, GpioBackend, GpioManager, api_scope};

#[cfg(not(feature = "hardware-gpio"))]
use gpio_edge::MockGpioBackend;
#[cfg(feature = "hardware-gpio")]
use gpio_edge::SysfsBackend;

async fn serve<B: GpioBackend + 'static>(
    config: Arc<AppConfig>,
    backend: Arc<B>,
) -> std::io::Result<()> {
    let manager = Arc::new(GpioManager::new(config.clone(), backend));
    manager.init();
    let app_state = AppState {
        manager: manager.clone(),
    };

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(api_scope::<B>(&scope_path))
    });

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        _ => {
            panic!("Config error: either 'unix_socket' or 'host' must be specified")
        }
    };

    info!("Starting server on {}...", bind_addrs);

    let result = server.run().await;

    if let Err(e) = manager.cleanup() {
        warn!("cleanup failed: {e}");
    }

    result
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIO_EDGE_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(
        AppConfig::load_from_file(&config_path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
    );

    #[cfg(feature = "hardware-gpio")]
    let backend = Arc::new(SysfsBackend::new(&config.sysfs_root));
    #[cfg(not(feature = "hardware-gpio"))]
    let backend = Arc::new(MockGpioBackend::default());

    serve(config, backend).await
}
