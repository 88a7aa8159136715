//! Conversation threads.
//!
//! Gmail assigns every message a thread id (X-GM-THRID). Exactly one
//! `threads` row must exist per thread id and account; to keep that true
//! under concurrent folder syncs, all thread creation goes through a single
//! [`ThreadResolver`] task per account which processes requests one at a
//! time.

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::context::Context;

/// A stored conversation thread.
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: i64,
    pub account_id: i64,
    pub g_thrid: u64,
    pub subject: Option<String>,
    /// Date of the message the subject was taken from.
    pub subject_date: DateTime<Utc>,
    /// Date of the newest message seen in the thread.
    pub recent_date: DateTime<Utc>,
    /// Labels of the folders the thread has messages in.
    pub folders: Vec<String>,
}

/// Strips the reply and forward prefixes off a subject.
pub fn clean_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_ascii_lowercase();
        let stripped = ["re:", "fwd:", "fw:", "aw:"]
            .iter()
            .find_map(|prefix| lower.starts_with(prefix).then(|| s[prefix.len()..].trim_start()));
        match stripped {
            Some(rest) => s = rest,
            None => return s.to_string(),
        }
    }
}

impl Thread {
    /// Loads the thread with the given provider thread id.
    ///
    /// More than one row for the same thread id means the store is corrupt;
    /// that is reported as an error, not silently resolved.
    pub async fn load_by_thrid(
        context: &Context,
        account_id: i64,
        g_thrid: u64,
    ) -> Result<Option<Thread>> {
        let count = context
            .sql
            .count(
                "SELECT COUNT(*) FROM threads WHERE account_id=? AND g_thrid=?",
                (account_id, g_thrid as i64),
            )
            .await?;
        if count > 1 {
            bail!("duplicate thread rows for thrid {g_thrid} on account {account_id}");
        }
        context
            .sql
            .query_row_optional(
                "SELECT id, subject, subject_date, recent_date, folders
                 FROM threads WHERE account_id=? AND g_thrid=?",
                (account_id, g_thrid as i64),
                |row| {
                    let subject_date: i64 = row.get(2)?;
                    let recent_date: i64 = row.get(3)?;
                    let folders: String = row.get(4)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        subject_date,
                        recent_date,
                        folders,
                    ))
                },
            )
            .await?
            .map(|(id, subject, subject_date, recent_date, folders)| {
                Ok(Thread {
                    id,
                    account_id,
                    g_thrid,
                    subject,
                    subject_date: timestamp(subject_date),
                    recent_date: timestamp(recent_date),
                    folders: serde_json::from_str(&folders)
                        .context("corrupt thread folder list")?,
                })
            })
            .transpose()
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// What the resolver needs to know about one message to place it in a thread.
#[derive(Debug, Clone)]
pub struct ThreadSeed {
    pub g_thrid: u64,
    pub subject: Option<String>,
    pub received_date: DateTime<Utc>,
    pub labels: Vec<String>,
}

struct ResolveRequest {
    seeds: Vec<ThreadSeed>,
    done: oneshot::Sender<Result<Vec<i64>>>,
}

impl std::fmt::Debug for ResolveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolveRequest")
            .field("seeds", &self.seeds.len())
            .finish()
    }
}

/// Handle to the per-account thread resolver task. Cloneable; one clone per
/// folder sync task.
#[derive(Debug, Clone)]
pub struct ThreadResolver {
    sender: async_channel::Sender<ResolveRequest>,
}

impl ThreadResolver {
    /// Spawns the resolver task for one account.
    ///
    /// The task exits once every [`ThreadResolver`] clone is dropped; await
    /// the returned handle to be sure all pending requests were served.
    pub fn spawn(context: Context, account_id: i64) -> (ThreadResolver, JoinHandle<()>) {
        let (sender, receiver) = async_channel::unbounded::<ResolveRequest>();
        let handle = tokio::spawn(async move {
            while let Ok(request) = receiver.recv().await {
                let res = resolve_batch(&context, account_id, &request.seeds).await;
                // Receiver gone means the folder task died; nothing to do.
                let _ = request.done.send(res);
            }
        });
        (ThreadResolver { sender }, handle)
    }

    /// Resolves the thread row ids for a batch of messages, creating or
    /// updating thread rows as needed. Returns ids in seed order.
    pub async fn resolve(&self, seeds: Vec<ThreadSeed>) -> Result<Vec<i64>> {
        let (done, ready) = oneshot::channel();
        self.sender
            .send(ResolveRequest { seeds, done })
            .await
            .map_err(|_| anyhow::anyhow!("thread resolver is gone"))?;
        ready.await.context("thread resolver dropped the request")?
    }
}

/// Serialized by the resolver task; the cache is scoped to one batch so a
/// thread touched twice within a batch hits the database only once.
async fn resolve_batch(
    context: &Context,
    account_id: i64,
    seeds: &[ThreadSeed],
) -> Result<Vec<i64>> {
    let mut cache: std::collections::HashMap<u64, i64> = Default::default();
    let mut res = Vec::with_capacity(seeds.len());
    for seed in seeds {
        if let Some(&id) = cache.get(&seed.g_thrid) {
            update_existing(context, id, seed).await?;
            res.push(id);
            continue;
        }
        let id = match Thread::load_by_thrid(context, account_id, seed.g_thrid).await? {
            Some(thread) => {
                update_existing(context, thread.id, seed).await?;
                thread.id
            }
            None => create_thread(context, account_id, seed).await?,
        };
        cache.insert(seed.g_thrid, id);
        res.push(id);
    }
    Ok(res)
}

async fn create_thread(context: &Context, account_id: i64, seed: &ThreadSeed) -> Result<i64> {
    let subject = seed.subject.as_deref().map(clean_subject);
    // Owned parameter tuples keep the insert future Send.
    context
        .sql
        .insert(
            "INSERT INTO threads (account_id, g_thrid, subject, subject_date, recent_date, folders)
             VALUES (?,?,?,?,?,?)",
            (
                account_id,
                seed.g_thrid as i64,
                subject,
                seed.received_date.timestamp(),
                seed.received_date.timestamp(),
                serde_json::to_string(&normalized_labels(&seed.labels))?,
            ),
        )
        .await
}

async fn update_existing(context: &Context, thread_id: i64, seed: &ThreadSeed) -> Result<()> {
    let (subject_date, recent_date, folders): (i64, i64, String) = context
        .sql
        .query_row(
            "SELECT subject_date, recent_date, folders FROM threads WHERE id=?",
            (thread_id,),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .await?;

    let mut folder_set: Vec<String> =
        serde_json::from_str(&folders).context("corrupt thread folder list")?;
    for label in normalized_labels(&seed.labels) {
        if !folder_set.contains(&label) {
            folder_set.push(label);
        }
    }
    folder_set.sort();

    let ts = seed.received_date.timestamp();
    let new_recent = recent_date.max(ts);

    // The subject tracks the oldest message of the thread.
    if ts < subject_date {
        let subject = seed.subject.as_deref().map(clean_subject);
        context
            .sql
            .execute(
                "UPDATE threads SET subject=?, subject_date=?, recent_date=?, folders=? WHERE id=?",
                (
                    subject,
                    ts,
                    new_recent,
                    serde_json::to_string(&folder_set)?,
                    thread_id,
                ),
            )
            .await?;
    } else {
        context
            .sql
            .execute(
                "UPDATE threads SET recent_date=?, folders=? WHERE id=?",
                (new_recent, serde_json::to_string(&folder_set)?, thread_id),
            )
            .await?;
    }
    Ok(())
}

fn normalized_labels(labels: &[String]) -> Vec<String> {
    let mut res: Vec<String> = labels.to_vec();
    res.sort();
    res.dedup();
    res
}
