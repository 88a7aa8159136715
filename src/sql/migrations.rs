//! Migrations module.

use anyhow::Result;

use crate::context::Context;
use crate::sql::Sql;

const DBVERSION: i64 = 1;
const VERSION_CFG: &str = "dbversion";
const TABLES: &str = include_str!("./tables.sql");

pub async fn run(context: &Context, sql: &Sql) -> Result<()> {
    let dbversion_before_update;

    if !sql.table_exists("config").await? {
        info!(context, "First time init: creating tables",);
        sql.transaction(move |transaction| {
            transaction.execute_batch(TABLES)?;

            // set raw config inside the transaction
            transaction.execute(
                "INSERT INTO config (keyname, value) VALUES (?, ?)",
                (VERSION_CFG, format!("{DBVERSION}")),
            )?;
            Ok(())
        })
        .await?;
        dbversion_before_update = DBVERSION;
    } else {
        dbversion_before_update = sql
            .get_raw_config_int64(VERSION_CFG)
            .await?
            .unwrap_or_default();
    }

    let dbversion = dbversion_before_update;

    // Future schema changes go here, guarded by `if dbversion < N`
    // and followed by bumping VERSION_CFG.
    let _ = dbversion;

    Ok(())
}
