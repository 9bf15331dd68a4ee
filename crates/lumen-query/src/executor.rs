//! The per-request pipeline: validate, bind, validate again, acquire, apply
//! the statement timeout, count if paginating, run, normalize, release.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lumen_db::{Connector, PgConnector, PoolRegistry, RowSet, Session, TargetDescriptor};
use serde_json::Value;
use tracing::{debug, warn};

use crate::binder::{BoundStatement, bind};
use crate::config::QueryLimits;
use crate::error::QueryError;
use crate::guard::{ValidatedSql, assert_safe_select, assert_safe_template};
use crate::normalize::{TimeRendering, normalize};
use crate::paginate::{COUNT_PREFIX, LimitArg, capped_query, count_query, page_query, scan_limit};
use crate::request::{PageInfo, QueryRequest, QueryResult, SqlSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u64,
    pub page_size: u64,
}

/// Request options after defaults and range checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub timeout: Duration,
    pub max_rows: usize,
    pub pagination: Option<Page>,
    /// Lets a smaller trailing `LIMIT` in the caller's SQL shrink the page.
    pub cap_page_by_limit: bool,
    pub rendering: TimeRendering,
}

impl ExecutionPlan {
    pub fn for_request(request: &QueryRequest, limits: &QueryLimits) -> Result<Self, QueryError> {
        let pagination = match request.pagination {
            None => None,
            Some(requested) => {
                let page = u64::try_from(requested.page)
                    .ok()
                    .filter(|page| *page >= 1)
                    .ok_or_else(|| QueryError::validation("page must be at least 1"))?;
                let page_size = u64::try_from(requested.page_size)
                    .ok()
                    .filter(|size| (1..=limits.max_page_size).contains(size))
                    .ok_or_else(|| {
                        QueryError::validation(format!(
                            "pageSize must be between 1 and {}",
                            limits.max_page_size
                        ))
                    })?;
                Some(Page { page, page_size })
            }
        };

        let max_rows = request.max_rows.unwrap_or(limits.default_max_rows);
        if max_rows == 0 {
            return Err(QueryError::validation("maxRows must be at least 1"));
        }
        let timeout = match request.timeout_ms {
            Some(0) => return Err(QueryError::validation("timeoutMs must be positive")),
            Some(ms) => Duration::from_millis(ms),
            None => limits.default_timeout(),
        };

        Ok(Self {
            timeout,
            max_rows,
            pagination,
            cap_page_by_limit: matches!(request.source, SqlSource::Sql(_)),
            rendering: if request.iso_temporal {
                TimeRendering::Iso
            } else {
                TimeRendering::for_zone(request.time_zone.as_deref())
            },
        })
    }
}

/// The statements one call will send, each already validated, with the
/// values their `$n` markers refer to.
enum Shape {
    Paged {
        count: ValidatedSql,
        rows: ValidatedSql,
        values: Vec<Value>,
        page: u64,
        page_size: u64,
    },
    Plain {
        sql: ValidatedSql,
        values: Vec<Value>,
    },
}

impl Shape {
    fn build(statement: &BoundStatement, plan: &ExecutionPlan) -> Result<Self, QueryError> {
        let sql = statement.sql();
        let scan = scan_limit(sql)?;
        let Some(Page { page, page_size }) = plan.pagination else {
            // A caller LIMIT is honoured as written; the row check runs afterwards.
            let sql = if scan.has_limit {
                sql.clone()
            } else {
                capped_query(sql.as_str(), plan.max_rows)?
            };
            return Ok(Self::Plain {
                sql,
                values: statement.values().to_vec(),
            });
        };

        let page_size = match (plan.cap_page_by_limit, scan.trailing_limit) {
            (true, Some(LimitArg::Rows(limit))) => page_size.min(limit),
            _ => page_size,
        };
        let offset = (page - 1)
            .checked_mul(page_size)
            .ok_or_else(|| QueryError::validation("page is out of range"))?;
        Ok(Self::Paged {
            count: count_query(&scan.body)?,
            rows: page_query(&scan.body, page_size, offset)?,
            values: scan.retained_values(statement.values()),
            page,
            page_size,
        })
    }
}

/// Runs read-only queries against tenant targets through a shared
/// [`PoolRegistry`].
pub struct QueryExecutor<C: Connector = PgConnector> {
    registry: Arc<PoolRegistry<C>>,
    limits: QueryLimits,
}

impl<C: Connector> QueryExecutor<C> {
    pub fn new(registry: Arc<PoolRegistry<C>>, limits: QueryLimits) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry<C>> {
        &self.registry
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }

    /// Validates the request's SQL and, for templates, binds and re-validates.
    pub fn prepare(&self, request: &QueryRequest) -> Result<BoundStatement, QueryError> {
        match &request.source {
            SqlSource::Sql(sql) => Ok(BoundStatement::from_validated(assert_safe_select(sql)?)),
            SqlSource::Template(template) => {
                let template = assert_safe_template(template)?;
                Ok(bind(&template, &request.params)?)
            }
        }
    }

    pub async fn execute(
        &self,
        request: &QueryRequest,
        target: &TargetDescriptor,
    ) -> Result<QueryResult, QueryError> {
        let outcome = async {
            let plan = ExecutionPlan::for_request(request, &self.limits)?;
            let statement = self.prepare(request)?;
            self.run(target, statement, &plan).await
        }
        .await;
        if let Err(err) = &outcome {
            warn!(
                pool = %target.pool_key(),
                user = %target.user,
                kind = err.kind(),
                code = err.code().unwrap_or("-"),
                sql = %truncate_sql(request.source.text(), self.limits.log_sql_chars),
                error = %err,
                "query failed"
            );
        }
        outcome
    }

    /// Runs an already-bound statement. The session goes back to its pool
    /// before this returns, whatever the outcome.
    pub async fn run(
        &self,
        target: &TargetDescriptor,
        statement: BoundStatement,
        plan: &ExecutionPlan,
    ) -> Result<QueryResult, QueryError> {
        let started = Instant::now();
        let shape = Shape::build(&statement, plan)?;

        let pool = self.registry.get_pool(target).await?;
        let session = pool.acquire().await?;
        let outcome = run_on_session(&*session, &shape, plan).await;
        pool.release(session);
        let (rowset, pagination) = outcome?;

        let (columns, rows) = normalize(rowset, plan.rendering);
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            pool = %pool.key(),
            rows = rows.len(),
            elapsed_ms,
            paginated = pagination.is_some(),
            "query completed"
        );
        Ok(QueryResult {
            columns,
            row_count: rows.len(),
            rows,
            elapsed_ms,
            pagination,
        })
    }
}

async fn run_on_session<S: Session>(
    session: &S,
    shape: &Shape,
    plan: &ExecutionPlan,
) -> Result<(RowSet, Option<PageInfo>), QueryError> {
    session.set_statement_timeout(plan.timeout).await?;
    match shape {
        Shape::Paged {
            count,
            rows,
            values,
            page,
            page_size,
        } => {
            let counted = session
                .query(count.as_str(), values)
                .await
                .map_err(|err| QueryError::from(err).shift_position(COUNT_PREFIX.len()))?;
            let total = counted
                .scalar_i64()
                .and_then(|total| u64::try_from(total).ok())
                .ok_or_else(|| QueryError::Execution {
                    code: None,
                    message: "count query returned no row count".to_string(),
                    detail: None,
                    position: None,
                    timed_out: false,
                })?;
            let rowset = session.query(rows.as_str(), values).await?;
            Ok((rowset, Some(PageInfo::new(*page, *page_size, total))))
        }
        Shape::Plain { sql, values } => {
            let rowset = session.query(sql.as_str(), values).await?;
            if rowset.rows.len() > plan.max_rows {
                return Err(QueryError::LimitExceeded {
                    rows: rowset.rows.len(),
                    max_rows: plan.max_rows,
                });
            }
            Ok((rowset, None))
        }
    }
}

fn truncate_sql(sql: &str, max_chars: usize) -> Cow<'_, str> {
    match sql.char_indices().nth(max_chars) {
        Some((cut, _)) => Cow::Owned(format!("{}...", &sql[..cut])),
        None => Cow::Borrowed(sql),
    }
}
