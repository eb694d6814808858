use uuid::Uuid;

use crate::auth::hash_password;
use crate::config::Config;
use crate::db::Db;

/// Seeds the admin account from `ADMIN_EMAIL` / `ADMIN_PASSWORD`.
/// Safe to call on every startup: an existing account is left alone
/// except for its role, which is forced back to admin.
pub async fn seed_accounts(pool: &Db, config: &Config) -> anyhow::Result<()> {
    seed_admin(pool, &config.admin_email, &config.admin_password).await
}

async fn seed_admin(pool: &Db, email: &str, password: &str) -> anyhow::Result<()> {
    let email = email.trim().to_lowercase();

    let existing: Option<(String, String)> =
        sqlx::query_as("SELECT id, role FROM users WHERE email = ? LIMIT 1")
            .bind(&email)
            .fetch_optional(pool)
            .await?;

    match existing {
        Some((id, role)) => {
            if role != "admin" {
                sqlx::query("UPDATE users SET role = 'admin', is_active = 1 WHERE id = ?")
                    .bind(&id)
                    .execute(pool)
                    .await?;
                tracing::info!(%email, "Promoted seeded account to admin");
            }
        }

        None => {
            let hash = hash_password(password)?;
            sqlx::query(
                "INSERT INTO users (id, email, password_hash, role, language, is_active)
                 VALUES (?, ?, ?, 'admin', 'en', 1)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&email)
            .bind(hash)
            .execute(pool)
            .await?;
            tracing::info!(%email, "Seeded admin account");
        }
    }

    Ok(())
}
