use std::{error::Error as StdError, process, sync::Arc};

use matryoshka::{
    application::{
        blog::{BlogService, Seed},
        error::AppError,
        repos::EntityStore,
        store::CascadingStore,
    },
    cache::{CacheConfig, CascadeConfig, FragmentCache, InvalidationCascade, MemoryBackend},
    config,
    domain::schema::SchemaRegistry,
    infra::{
        db::PostgresEntityStore,
        error::InfraError,
        http::{self, DemoState},
        memory::MemoryEntityStore,
        telemetry,
    },
    presentation::views::builtin_templates,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let mut chain = Vec::new();
    let mut current = StdError::source(error);
    while let Some(inner) = current {
        chain.push(inner.to_string());
        current = inner.source();
    }

    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?chain, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?chain, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let schemas = SchemaRegistry::from_declarations(&settings.kinds);

    match command {
        config::Command::Serve(_) => run_serve(settings, schemas).await,
        config::Command::Check => run_check(&schemas),
    }
}

fn run_check(schemas: &SchemaRegistry) -> Result<(), AppError> {
    let problems = schemas.check();
    for problem in &problems {
        error!(error = %problem, "invalid kind declaration");
    }

    if problems.is_empty() {
        info!(kinds = schemas.len(), "kind declarations are valid");
        Ok(())
    } else {
        Err(AppError::from(InfraError::InvalidKinds {
            count: problems.len(),
        }))
    }
}

async fn run_serve(settings: config::Settings, schemas: SchemaRegistry) -> Result<(), AppError> {
    // Broken declarations only fail the writes that reach them.
    for problem in schemas.check() {
        warn!(error = %problem, "kind declaration will fail on write");
    }

    let (store, database) = init_store(&settings).await?;
    let cascade = Arc::new(InvalidationCascade::new(
        Arc::new(schemas),
        CascadeConfig::from(&settings.cascade),
    ));
    let blog = BlogService::new(CascadingStore::new(store, cascade));

    let cache_config = CacheConfig::from(&settings.cache);
    let backend = Arc::new(MemoryBackend::new(&cache_config));
    let cache = Arc::new(FragmentCache::new(cache_config, backend));

    let templates = Arc::new(builtin_templates()?);
    let seed = Seed::builtin()?;

    let state = DemoState {
        blog,
        blog_name: Arc::from(seed.blog.name.as_str()),
        seed: Arc::new(seed),
        cache,
        templates,
        database,
    };

    serve_http(&settings, state).await
}

type StoreHandles = (Arc<dyn EntityStore>, Option<Arc<PostgresEntityStore>>);

async fn init_store(settings: &config::Settings) -> Result<StoreHandles, AppError> {
    let Some(database_url) = settings.database.url.as_ref() else {
        info!("no database configured; keeping entities in memory");
        return Ok((Arc::new(MemoryEntityStore::new()), None));
    };

    let pool =
        PostgresEntityStore::connect(database_url, settings.database.max_connections.get())
            .await
            .map_err(InfraError::Connect)?;

    PostgresEntityStore::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;

    let database = Arc::new(PostgresEntityStore::new(pool));
    let store: Arc<dyn EntityStore> = database.clone();
    Ok((store, Some(database)))
}

async fn serve_http(settings: &config::Settings, state: DemoState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| InfraError::bind(settings.server.addr, err))?;
    info!(addr = %settings.server.addr, "serving demo");

    let server = axum::serve(listener, router.into_make_service());
    tokio::select! {
        result = server => {
            result.map_err(InfraError::Serve)?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
