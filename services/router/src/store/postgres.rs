//! PostgreSQL-backed route store.
//!
//! Tables (provisioned externally):
//! - `http_routes` / `tcp_routes`: one row per route, soft-deleted through
//!   `deleted_at`. Uniqueness of `(domain, port, path)` and of TCP ports among
//!   live rows is enforced by partial unique indexes; the root-route and
//!   drain-backends rules are enforced by triggers raising exceptions.
//! - `certificates`: keyed by chain fingerprint.
//! - `route_certificates`: HTTP route to certificate links.
//!
//! Row triggers call `pg_notify('{namespace}_{table}', id)` on every change.
//! Watchers re-read the row to decide between `set` and `remove`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use gatehouse_types::{Certificate, Event, Route, RouteError, RouteType};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RouteStore, RouteStream};
use crate::error::RouterError;

const HTTP_COLUMNS: &str = r#"
    r.id, r.parent_ref, r.service, r.port, r.leader, r.drain_backends,
    r.domain, r.sticky, r.path, r.disabled, r.created_at, r.updated_at,
    c.id AS cert_id, c.chain AS cert_chain, c.key AS cert_key, c.key_id AS cert_key_id,
    c.created_at AS cert_created_at, c.updated_at AS cert_updated_at,
    ARRAY(
        SELECT rc2.http_route_id::text FROM route_certificates AS rc2
        WHERE rc2.certificate_id = c.id
    ) AS cert_routes
"#;

const HTTP_FROM: &str = r#"
    FROM http_routes AS r
    LEFT OUTER JOIN route_certificates AS rc ON rc.http_route_id = r.id
    LEFT OUTER JOIN certificates AS c ON c.id = rc.certificate_id
"#;

const TCP_COLUMNS: &str = r#"
    id, parent_ref, service, port, leader, drain_backends, disabled, created_at, updated_at
"#;

/// Route store over a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    namespace: String,
}

impl PostgresStore {
    /// Connect a pool to `database_url`.
    ///
    /// `namespace` prefixes notification channel names so that several
    /// routers can share one database.
    pub async fn connect(database_url: &str, namespace: &str) -> Result<Self, RouterError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;
        let namespace = channel_namespace(namespace);
        info!(namespace = %namespace, "connected to route database");
        Ok(Self { pool, namespace })
    }

    fn channel(&self, route_type: RouteType) -> String {
        format!("{}_{}", self.namespace, table(route_type))
    }

    async fn fetch(
        &self,
        route_type: RouteType,
        id: Uuid,
    ) -> Result<Option<Route>, RouterError> {
        let row = match route_type {
            RouteType::Http => {
                let sql = format!(
                    "SELECT {HTTP_COLUMNS} {HTTP_FROM} WHERE r.id = $1 AND r.deleted_at IS NULL"
                );
                sqlx::query(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            RouteType::Tcp => {
                let sql = format!(
                    "SELECT {TCP_COLUMNS} FROM tcp_routes WHERE id = $1 AND deleted_at IS NULL"
                );
                sqlx::query(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        row.map(|row| decode_route(route_type, &row)).transpose()
    }

    /// Translate one notification payload into a `set` or `remove` event.
    async fn notification_event(
        &self,
        route_type: RouteType,
        payload: &str,
    ) -> Result<Event, RouterError> {
        let id = Uuid::parse_str(payload)
            .map_err(|e| RouterError::Store(format!("bad notification {payload:?}: {e}")))?;
        match self.fetch(route_type, id).await? {
            Some(route) => Ok(Event::set(route.without_key())),
            None => Ok(Event::remove(Route::reference(route_type, payload))),
        }
    }
}

#[async_trait]
impl RouteStore for PostgresStore {
    async fn add(&self, mut route: Route) -> Result<Route, RouterError> {
        route.normalize();
        route.validate()?;

        let mut tx = self.pool.begin().await?;
        let row = match route.route_type {
            RouteType::Http => {
                sqlx::query(
                    r#"
                    INSERT INTO http_routes
                        (parent_ref, service, port, leader, drain_backends, domain, sticky, path, disabled)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    RETURNING id, created_at, updated_at
                    "#,
                )
                .bind(&route.parent_ref)
                .bind(&route.service)
                .bind(route.port)
                .bind(route.leader)
                .bind(route.drain_backends)
                .bind(&route.domain)
                .bind(route.sticky)
                .bind(&route.path)
                .bind(route.disabled)
                .fetch_one(&mut *tx)
                .await?
            }
            RouteType::Tcp => {
                if route.port == 0 {
                    return Err(RouteError::InvalidPort(0).into());
                }
                // A port keeps its id across re-creation, so a soft-deleted
                // row with the same id is revived rather than duplicated.
                sqlx::query(
                    r#"
                    INSERT INTO tcp_routes (id, parent_ref, service, port, leader, drain_backends, disabled)
                    VALUES (COALESCE($1, gen_random_uuid()), $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (id) DO UPDATE
                    SET parent_ref = EXCLUDED.parent_ref, service = EXCLUDED.service,
                        port = EXCLUDED.port, leader = EXCLUDED.leader,
                        drain_backends = EXCLUDED.drain_backends, disabled = EXCLUDED.disabled,
                        created_at = now(), updated_at = now(), deleted_at = NULL
                    WHERE tcp_routes.deleted_at IS NOT NULL
                    RETURNING id, created_at, updated_at
                    "#,
                )
                .bind(requested_id(&route)?)
                .bind(&route.parent_ref)
                .bind(&route.service)
                .bind(route.port)
                .bind(route.leader)
                .bind(route.drain_backends)
                .bind(route.disabled)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    RouterError::Conflict(format!("tcp route {} already exists", route.id))
                })?
            }
        };
        let id: Uuid = row.try_get("id")?;
        route.id = id.to_string();
        route.created_at = Some(row.try_get("created_at")?);
        route.updated_at = Some(row.try_get("updated_at")?);

        if let Some(cert) = route.certificate.take() {
            route.certificate = Some(attach_certificate(&mut tx, id, &cert).await?);
        }
        tx.commit().await?;

        debug!(route_id = %route.formatted_id(), "route added");
        Ok(route.without_key())
    }

    async fn update(&self, mut route: Route) -> Result<Route, RouterError> {
        route.normalize();
        route.validate()?;
        let id = Uuid::parse_str(&route.id).map_err(|_| RouterError::NotFound)?;

        let mut tx = self.pool.begin().await?;
        let row = match route.route_type {
            RouteType::Http => {
                sqlx::query(
                    r#"
                    UPDATE http_routes
                    SET parent_ref = $1, service = $2, leader = $3, sticky = $4, path = $5,
                        disabled = $6, drain_backends = $7, updated_at = now()
                    WHERE id = $8 AND domain = $9 AND port = $10 AND deleted_at IS NULL
                    RETURNING created_at, updated_at
                    "#,
                )
                .bind(&route.parent_ref)
                .bind(&route.service)
                .bind(route.leader)
                .bind(route.sticky)
                .bind(&route.path)
                .bind(route.disabled)
                .bind(route.drain_backends)
                .bind(id)
                .bind(&route.domain)
                .bind(route.port)
                .fetch_optional(&mut *tx)
                .await?
            }
            RouteType::Tcp => {
                sqlx::query(
                    r#"
                    UPDATE tcp_routes
                    SET parent_ref = $1, service = $2, leader = $3, drain_backends = $4,
                        disabled = $5, updated_at = now()
                    WHERE id = $6 AND port = $7 AND deleted_at IS NULL
                    RETURNING created_at, updated_at
                    "#,
                )
                .bind(&route.parent_ref)
                .bind(&route.service)
                .bind(route.leader)
                .bind(route.drain_backends)
                .bind(route.disabled)
                .bind(id)
                .bind(route.port)
                .fetch_optional(&mut *tx)
                .await?
            }
        };
        let row = row.ok_or(RouterError::NotFound)?;
        route.created_at = Some(row.try_get("created_at")?);
        route.updated_at = Some(row.try_get("updated_at")?);

        if route.route_type == RouteType::Http {
            let previous = detach_certificate(&mut tx, id).await?;
            if let Some(cert) = route.certificate.take() {
                route.certificate = Some(attach_certificate(&mut tx, id, &cert).await?);
            }
            if let Some(previous) = previous {
                delete_orphaned_certificate(&mut tx, &previous).await?;
            }
        }
        tx.commit().await?;

        debug!(route_id = %route.formatted_id(), "route updated");
        Ok(route.without_key())
    }

    async fn get(&self, route_type: RouteType, id: &str) -> Result<Route, RouterError> {
        let id = Uuid::parse_str(id).map_err(|_| RouterError::NotFound)?;
        self.fetch(route_type, id)
            .await?
            .map(|route| route.without_key())
            .ok_or(RouterError::NotFound)
    }

    async fn list(&self, route_type: RouteType) -> Result<Vec<Route>, RouterError> {
        let rows = match route_type {
            RouteType::Http => {
                let sql = format!(
                    "SELECT {HTTP_COLUMNS} {HTTP_FROM} WHERE r.deleted_at IS NULL \
                     ORDER BY r.domain, r.port, r.path"
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
            RouteType::Tcp => {
                let sql = format!(
                    "SELECT {TCP_COLUMNS} FROM tcp_routes WHERE deleted_at IS NULL ORDER BY port"
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(|row| decode_route(route_type, row)).collect()
    }

    async fn remove(&self, route_type: RouteType, id: &str) -> Result<(), RouterError> {
        let id = Uuid::parse_str(id).map_err(|_| RouterError::NotFound)?;
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE {} SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
            table(route_type)
        );
        let result = sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(RouterError::NotFound);
        }
        if route_type == RouteType::Http {
            if let Some(cert_id) = detach_certificate(&mut tx, id).await? {
                delete_orphaned_certificate(&mut tx, &cert_id).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn watch(&self, route_type: RouteType) -> Result<RouteStream, RouterError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        let channel = self.channel(route_type);
        listener.listen(&channel).await?;
        debug!(channel = %channel, "listening for route notifications");

        let store = self.clone();
        let stream = stream::unfold(
            (listener, store),
            move |(mut listener, store)| async move {
                let item = match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        store
                            .notification_event(route_type, notification.payload())
                            .await
                    }
                    // The connection dropped and notifications may have been
                    // missed; the next recv reconnects.
                    Ok(None) => {
                        warn!("route notification connection lost");
                        Err(RouterError::TooOld)
                    }
                    Err(e) => Err(e.into()),
                };
                Some((item, (listener, store)))
            },
        );
        Ok(stream.boxed())
    }

    async fn private_key(&self, key_id: &str) -> Result<String, RouterError> {
        let row = sqlx::query("SELECT key FROM certificates WHERE key_id = $1 LIMIT 1")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RouterError::NotFound)?;
        Ok(row.try_get("key")?)
    }

    async fn ping(&self) -> Result<(), RouterError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn table(route_type: RouteType) -> &'static str {
    match route_type {
        RouteType::Http => "http_routes",
        RouteType::Tcp => "tcp_routes",
    }
}

/// Reduce a store prefix such as `/router` to a channel-safe identifier.
fn channel_namespace(prefix: &str) -> String {
    let namespace: String = prefix
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            '/' | '-' | '.' => Some('_'),
            _ => None,
        })
        .collect();
    let namespace = namespace.trim_matches('_');
    if namespace.is_empty() {
        "router".to_string()
    } else {
        namespace.to_string()
    }
}

/// The caller-chosen id of a new route, if any.
fn requested_id(route: &Route) -> Result<Option<Uuid>, RouterError> {
    if route.id.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(&route.id)
        .map(Some)
        .map_err(|_| RouteError::Rejected(format!("invalid route id {:?}", route.id)).into())
}

fn decode_route(route_type: RouteType, row: &PgRow) -> Result<Route, RouterError> {
    let id: Uuid = row.try_get("id")?;
    let mut route = Route::reference(route_type, id.to_string());
    route.parent_ref = row.try_get("parent_ref")?;
    route.service = row.try_get("service")?;
    route.port = row.try_get("port")?;
    route.leader = row.try_get("leader")?;
    route.drain_backends = row.try_get("drain_backends")?;
    route.disabled = row.try_get("disabled")?;
    route.created_at = Some(row.try_get("created_at")?);
    route.updated_at = Some(row.try_get("updated_at")?);
    if route_type == RouteType::Tcp {
        return Ok(route);
    }

    route.domain = row.try_get("domain")?;
    route.sticky = row.try_get("sticky")?;
    route.path = row.try_get("path")?;
    let cert_id: Option<String> = row.try_get("cert_id")?;
    if let Some(cert_id) = cert_id {
        route.certificate = Some(Certificate {
            id: cert_id,
            routes: row.try_get("cert_routes")?,
            chain: row.try_get("cert_chain")?,
            key: row.try_get("cert_key")?,
            key_id: row.try_get("cert_key_id")?,
            created_at: row.try_get::<Option<DateTime<Utc>>, _>("cert_created_at")?,
            updated_at: row.try_get::<Option<DateTime<Utc>>, _>("cert_updated_at")?,
        });
    }
    Ok(route)
}

/// Link `route_id` to `cert`, inserting the certificate if its fingerprint
/// is new.
async fn attach_certificate(
    tx: &mut Transaction<'_, Postgres>,
    route_id: Uuid,
    cert: &Certificate,
) -> Result<Certificate, RouterError> {
    let mut cert = cert.clone();
    if !cert.chain.is_empty() {
        cert.normalize()?;
    }

    let existing = sqlx::query(
        "SELECT id, chain, key, key_id, created_at, updated_at FROM certificates WHERE id = $1",
    )
    .bind(&cert.id)
    .fetch_optional(&mut **tx)
    .await?;
    let row = match existing {
        Some(row) => row,
        None if cert.chain.is_empty() => {
            return Err(
                RouteError::InvalidCertificate(format!("unknown certificate {:?}", cert.id)).into(),
            );
        }
        None if cert.key.is_empty() => {
            return Err(RouteError::InvalidCertificate("missing private key".to_string()).into());
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO certificates (id, chain, key, key_id)
                VALUES ($1, $2, $3, $4)
                RETURNING id, chain, key, key_id, created_at, updated_at
                "#,
            )
            .bind(&cert.id)
            .bind(&cert.chain)
            .bind(&cert.key)
            .bind(&cert.key_id)
            .fetch_one(&mut **tx)
            .await?
        }
    };

    sqlx::query("INSERT INTO route_certificates (http_route_id, certificate_id) VALUES ($1, $2)")
        .bind(route_id)
        .bind(&cert.id)
        .execute(&mut **tx)
        .await?;

    let routes: Vec<String> = sqlx::query_scalar(
        "SELECT http_route_id::text FROM route_certificates WHERE certificate_id = $1",
    )
    .bind(&cert.id)
    .fetch_all(&mut **tx)
    .await?;

    Ok(Certificate {
        id: row.try_get("id")?,
        routes,
        chain: row.try_get("chain")?,
        key: row.try_get("key")?,
        key_id: row.try_get("key_id")?,
        created_at: Some(row.try_get("created_at")?),
        updated_at: Some(row.try_get("updated_at")?),
    })
}

/// Unlink a route's certificate, returning the certificate id.
async fn detach_certificate(
    tx: &mut Transaction<'_, Postgres>,
    route_id: Uuid,
) -> Result<Option<String>, RouterError> {
    let cert_id = sqlx::query_scalar(
        "DELETE FROM route_certificates WHERE http_route_id = $1 RETURNING certificate_id",
    )
    .bind(route_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(cert_id)
}

async fn delete_orphaned_certificate(
    tx: &mut Transaction<'_, Postgres>,
    cert_id: &str,
) -> Result<(), RouterError> {
    sqlx::query(
        r#"
        DELETE FROM certificates
        WHERE id = $1
          AND NOT EXISTS (SELECT 1 FROM route_certificates WHERE certificate_id = $1)
        "#,
    )
    .bind(cert_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
