use clap::Parser;

use httpcraft::cache::CacheManager;
use httpcraft::cli::{self, Cli};
use httpcraft::core::app::App;

#[tokio::main]
async fn main() {
    // Initialize logging (RUST_LOG controls internal diagnostics)
    env_logger::init();

    let cli = Cli::parse();

    let app = match App::new() {
        Ok(app) => app,
        Err(e) => {
            eprintln!("{} {e}", e.prefix());
            std::process::exit(1);
        }
    };
    CacheManager::spawn_cleanup(&app.cache);

    let code = match cli::run(cli, &app).await {
        Ok(code) => code,
        Err(e) => {
            // Secrets are masked before anything reaches stderr.
            let message = app.mask.mask(&e.to_string());
            eprintln!("{} {message}", e.prefix());
            1
        }
    };

    app.shutdown();
    std::process::exit(code);
}
