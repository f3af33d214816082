//! `relay lease status`

use anyhow::Result;
use relay_lease::LeaseFactory;
use sqlx::PgPool;

pub async fn status(pool: &PgPool, resource_name: &str) -> Result<()> {
    let factory = LeaseFactory::new(pool.clone());
    match factory.inspect(resource_name).await? {
        Some(snapshot) => println!(
            "resource={} held={} fencing_token={} expires_at_utc={}",
            snapshot.resource_name,
            snapshot.is_held(),
            snapshot.fencing_token,
            snapshot.expires_at_utc
        ),
        None => println!("resource={resource_name} held=false"),
    }
    Ok(())
}
