use helmsman_core::config::LoadOptions;
use helmsman_db::{connect_with_settings, migrations};

use crate::commands::{load_config, runtime, CommandResult, EXIT_RUNTIME};

pub fn run(options: LoadOptions) -> CommandResult {
    let config = match load_config("migrate", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("migrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string()))?;
        migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string()))?;
        let applied = migrations::MIGRATOR.iter().filter(|migration| migration.migration_type.is_up_migration()).count();
        pool.close().await;
        Ok::<usize, (&'static str, String)>(applied)
    });

    match result {
        Ok(applied) => CommandResult::success(
            "migrate",
            format!("database schema is current ({applied} migrations known)"),
        ),
        Err((error_class, message)) => {
            CommandResult::failure("migrate", error_class, message, EXIT_RUNTIME)
        }
    }
}
