use crate::models::{EmailEventType, Error, TeamId};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "metric_period", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MetricPeriod {
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EmailMetrics {
    pub team_id: TeamId,
    pub period_start: DateTime<Utc>,
    pub period_type: MetricPeriod,
    pub sent: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub failed: i64,
    pub opened: i64,
    pub clicked: i64,
    pub complained: i64,
}

/// Event types that have a counter column. Queued and unsubscribed events
/// are not aggregated.
pub fn counter_column(event_type: EmailEventType) -> Option<&'static str> {
    match event_type {
        EmailEventType::Sent => Some("sent"),
        EmailEventType::Delivered => Some("delivered"),
        EmailEventType::Bounced => Some("bounced"),
        EmailEventType::Failed => Some("failed"),
        EmailEventType::Opened => Some("opened"),
        EmailEventType::Clicked => Some("clicked"),
        EmailEventType::Complained => Some("complained"),
        EmailEventType::Queued | EmailEventType::Unsubscribed => None,
    }
}

pub fn floor_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::hours(1)).expect("hour truncation cannot fail")
}

pub fn floor_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::days(1)).expect("day truncation cannot fail")
}

#[derive(Clone)]
pub struct MetricsRepository {
    pool: sqlx::PgPool,
}

impl MetricsRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Real-time path: additive upsert of the hourly and daily buckets.
    /// Concurrent workers add without loss because the update is relative.
    pub async fn bump(&self, team_id: TeamId, event_type: EmailEventType) -> Result<(), Error> {
        let Some(column) = counter_column(event_type) else {
            return Ok(());
        };
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        for (period_start, period_type) in [
            (floor_hour(now), MetricPeriod::Hourly),
            (floor_day(now), MetricPeriod::Daily),
        ] {
            sqlx::query(&format!(
                r#"
                INSERT INTO email_metrics (team_id, period_start, period_type, {column})
                VALUES ($1, $2, $3, 1)
                ON CONFLICT (team_id, period_start, period_type)
                DO UPDATE SET {column} = email_metrics.{column} + 1
                "#
            ))
            .bind(team_id)
            .bind(period_start)
            .bind(period_type)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Reconciliation path: recount the completed hour from the event log
    /// and upsert with GREATEST so a missed real-time increment is repaired
    /// without ever double-counting.
    pub async fn reconcile_hour(&self, hour_start: DateTime<Utc>) -> Result<u64, Error> {
        let hour_end = hour_start + Duration::hours(1);

        let rows = sqlx::query_as::<_, (TeamId, EmailEventType, i64)>(
            r#"
            SELECT e.team_id, ev.event_type, COUNT(*)
            FROM email_events ev
                JOIN emails e ON e.id = ev.email_id
            WHERE ev.created_at >= $1 AND ev.created_at < $2
            GROUP BY e.team_id, ev.event_type
            "#,
        )
        .bind(hour_start)
        .bind(hour_end)
        .fetch_all(&self.pool)
        .await?;

        let mut reconciled = 0;
        for (team_id, event_type, count) in rows {
            let Some(column) = counter_column(event_type) else {
                continue;
            };
            sqlx::query(&format!(
                r#"
                INSERT INTO email_metrics (team_id, period_start, period_type, {column})
                VALUES ($1, $2, 'hourly', $3)
                ON CONFLICT (team_id, period_start, period_type)
                DO UPDATE SET {column} = GREATEST(email_metrics.{column}, EXCLUDED.{column})
                "#
            ))
            .bind(team_id)
            .bind(hour_start)
            .bind(count)
            .execute(&self.pool)
            .await?;
            reconciled += 1;
        }

        Ok(reconciled)
    }

    pub async fn list(
        &self,
        team_id: TeamId,
        period_type: MetricPeriod,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmailMetrics>, Error> {
        let metrics = sqlx::query_as::<_, EmailMetrics>(
            r#"
            SELECT team_id, period_start, period_type, sent, delivered, bounced,
                   failed, opened, clicked, complained
            FROM email_metrics
            WHERE team_id = $1 AND period_type = $2 AND period_start >= $3
            ORDER BY period_start
            "#,
        )
        .bind(team_id)
        .bind(period_type)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(metrics)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_floors() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(
            floor_hour(at),
            Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap()
        );
        assert_eq!(
            floor_day(at),
            Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn only_terminal_and_engagement_events_count() {
        assert_eq!(counter_column(EmailEventType::Sent), Some("sent"));
        assert_eq!(counter_column(EmailEventType::Bounced), Some("bounced"));
        assert_eq!(counter_column(EmailEventType::Clicked), Some("clicked"));
        assert_eq!(counter_column(EmailEventType::Queued), None);
        assert_eq!(counter_column(EmailEventType::Unsubscribed), None);
    }
}
