//! Daily task sets, progress and the streak hook.
//!
//! A set is generated once per (account, date) and never changes after
//! that. Completing an instance credits its reward; the easy completion
//! that reaches the streak bar marks the day active.

use chrono::{DateTime, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::config::{DailyTaskConfig, StreakConfig};
use crate::db::LoyaltyDb;
use crate::error::{LoyaltyError, Result};
use crate::ledger::{self, LedgerChange, PointSource};
use crate::social::SocialNetwork;
use crate::status::TierTable;
use crate::store::LoyaltyStore;
use crate::streaks::{self, StreakUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Engagement,
    Social,
    Shopping,
    Referral,
}

/// Static task definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyTaskDefinition {
    pub code: &'static str,
    pub name: &'static str,
    pub difficulty: Difficulty,
    pub target: i64,
    pub reward: i64,
    pub category: TaskCategory,
    /// Only offered when this network is linked
    pub network: Option<SocialNetwork>,
    /// Part of every set
    pub mandatory: bool,
}

impl DailyTaskDefinition {
    const fn new(
        code: &'static str,
        name: &'static str,
        difficulty: Difficulty,
        target: i64,
        reward: i64,
        category: TaskCategory,
    ) -> Self {
        Self {
            code,
            name,
            difficulty,
            target,
            reward,
            category,
            network: None,
            mandatory: false,
        }
    }

    const fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    const fn on(mut self, network: SocialNetwork) -> Self {
        self.network = Some(network);
        self
    }
}

/// Built-in task catalog
pub fn catalog() -> Vec<DailyTaskDefinition> {
    use Difficulty::*;
    use TaskCategory::*;

    vec![
        DailyTaskDefinition::new("daily_login", "Open the app", Easy, 1, 5, Engagement).mandatory(),
        DailyTaskDefinition::new("browse_catalog", "Browse 3 catalog pages", Easy, 3, 5, Engagement).mandatory(),
        DailyTaskDefinition::new("check_balance", "Check your points", Easy, 1, 5, Engagement).mandatory(),
        DailyTaskDefinition::new("read_news", "Read today's news", Easy, 1, 5, Engagement).mandatory(),
        DailyTaskDefinition::new("vk_like", "Like our VK post", Easy, 1, 10, Social).on(SocialNetwork::Vk),
        DailyTaskDefinition::new("instagram_story", "Share an Instagram story", Easy, 1, 10, Social).on(SocialNetwork::Instagram),
        DailyTaskDefinition::new("scan_receipt", "Scan a receipt", Medium, 1, 20, Shopping),
        DailyTaskDefinition::new("share_app", "Share the app", Medium, 1, 20, Engagement),
        DailyTaskDefinition::new("rate_product", "Rate 2 products", Medium, 2, 20, Shopping),
        DailyTaskDefinition::new("make_purchase", "Make a purchase", Hard, 1, 50, Shopping),
        DailyTaskDefinition::new("invite_friend", "Invite a friend", Hard, 1, 50, Referral),
        DailyTaskDefinition::new("write_reviews", "Write 3 reviews", Hard, 3, 40, Shopping),
    ]
}

/// Easy tasks that can land in a day's set regardless of the roll: every
/// mandatory task plus one per social network
pub fn guaranteed_task_count(catalog: &[DailyTaskDefinition]) -> usize {
    catalog
        .iter()
        .filter(|t| t.difficulty == Difficulty::Easy && (t.mandatory || t.network.is_some()))
        .count()
}

/// Pick the task set for one day.
///
/// Order: mandatory easy tasks, social tasks for linked networks, exactly
/// one medium task, then hard tasks rolled with the tier's chance while
/// below `max_tasks`, padded with hard tasks up to `min_tasks`.
pub fn select_tasks<'a, R: Rng + ?Sized>(
    catalog: &'a [DailyTaskDefinition],
    linked: &[SocialNetwork],
    tier_rank: usize,
    config: &DailyTaskConfig,
    rng: &mut R,
) -> Vec<&'a DailyTaskDefinition> {
    let mut selected: Vec<&DailyTaskDefinition> = catalog
        .iter()
        .filter(|t| t.difficulty == Difficulty::Easy)
        .filter(|t| match t.network {
            Some(network) => linked.contains(&network),
            None => t.mandatory,
        })
        .collect();

    let medium: Vec<_> = catalog.iter().filter(|t| t.difficulty == Difficulty::Medium).collect();
    if let Some(task) = medium.choose(rng) {
        selected.push(*task);
    }

    let mut hard: Vec<_> = catalog.iter().filter(|t| t.difficulty == Difficulty::Hard).collect();
    hard.shuffle(rng);
    let chance = config.hard_chance_for_rank(tier_rank);
    let mut leftover = Vec::new();
    for task in hard {
        if selected.len() < config.max_tasks && rng.gen_bool(chance) {
            selected.push(task);
        } else {
            leftover.push(task);
        }
    }

    for task in leftover {
        if selected.len() >= config.min_tasks {
            break;
        }
        selected.push(task);
    }

    selected
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTaskInstance {
    pub id: i64,
    pub account_id: String,
    pub task_code: String,
    pub task_date: NaiveDate,
    pub progress: i64,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub reward_earned: i64,
}

/// Instance joined with its definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTask {
    pub code: String,
    pub name: String,
    pub difficulty: Difficulty,
    pub date: NaiveDate,
    pub progress: i64,
    pub target: i64,
    pub reward: i64,
    pub completed: bool,
    pub reward_earned: i64,
}

impl DailyTask {
    fn from_instance(instance: DailyTaskInstance, definitions: &[DailyTaskDefinition]) -> Option<Self> {
        let def = definitions.iter().find(|d| d.code == instance.task_code)?;
        Some(Self {
            code: instance.task_code,
            name: def.name.to_string(),
            difficulty: def.difficulty,
            date: instance.task_date,
            progress: instance.progress,
            target: def.target,
            reward: def.reward,
            completed: instance.completed,
            reward_earned: instance.reward_earned,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgressUpdate {
    pub task: DailyTask,
    /// True when this call finished the task
    pub completed_now: bool,
    pub credit: Option<LedgerChange>,
    pub streak: Option<StreakUpdate>,
}

fn find_definition<'a>(definitions: &'a [DailyTaskDefinition], code: &str) -> Result<&'a DailyTaskDefinition> {
    definitions
        .iter()
        .find(|d| d.code == code)
        .ok_or_else(|| LoyaltyError::not_found("task definition", code))
}

fn to_views(instances: Vec<DailyTaskInstance>, definitions: &[DailyTaskDefinition]) -> Vec<DailyTask> {
    instances
        .into_iter()
        .filter_map(|instance| DailyTask::from_instance(instance, definitions))
        .collect()
}

/// Generate the set for (account, date) unless it already exists.
/// Returns the instances and whether they were created by this call.
pub(crate) fn generate_in<R: Rng + ?Sized>(
    store: &dyn LoyaltyStore,
    definitions: &[DailyTaskDefinition],
    config: &DailyTaskConfig,
    tiers: &TierTable,
    account_id: &str,
    date: NaiveDate,
    rng: &mut R,
) -> Result<(Vec<DailyTaskInstance>, bool)> {
    let account = store
        .load_account(account_id)?
        .ok_or_else(|| LoyaltyError::not_found("account", account_id))?;

    if store.count_task_instances(account_id, date)? > 0 {
        return Ok((store.list_task_instances(account_id, date)?, false));
    }

    let linked = store.linked_networks(account_id)?;
    let rank = tiers.rank_for_balance(account.balance);
    for task in select_tasks(definitions, &linked, rank, config, rng) {
        store.insert_task_instance(account_id, task.code, date)?;
    }
    Ok((store.list_task_instances(account_id, date)?, true))
}

/// Apply progress to one instance. Must run inside the caller's transaction.
#[allow(clippy::too_many_arguments)]
pub(crate) fn update_progress_in(
    store: &dyn LoyaltyStore,
    definitions: &[DailyTaskDefinition],
    streak_config: &StreakConfig,
    account_id: &str,
    task_code: &str,
    increment: i64,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<TaskProgressUpdate> {
    if increment <= 0 {
        return Err(LoyaltyError::InvalidAmount(increment));
    }
    let key = format!("{}@{}", task_code, date);
    let instance = store
        .find_task_instance(account_id, task_code, date)?
        .ok_or_else(|| LoyaltyError::not_found("daily task", key.as_str()))?;
    if instance.completed {
        return Err(LoyaltyError::already_completed("daily task", key));
    }
    let def = find_definition(definitions, task_code)?;

    let progress = (instance.progress + increment).min(def.target);
    if progress < def.target {
        store.update_task_progress(instance.id, progress)?;
        let task = DailyTask::from_instance(
            DailyTaskInstance { progress, ..instance },
            definitions,
        )
        .ok_or_else(|| LoyaltyError::not_found("task definition", task_code))?;
        return Ok(TaskProgressUpdate {
            task,
            completed_now: false,
            credit: None,
            streak: None,
        });
    }

    if !store.complete_task_instance(instance.id, progress, def.reward, now)? {
        return Err(LoyaltyError::already_completed("daily task", key));
    }
    let credit = if def.reward > 0 {
        Some(ledger::credit_in(
            store,
            account_id,
            def.reward,
            PointSource::DailyTask,
            &format!("daily_task:{}", key),
            now,
        )?)
    } else {
        None
    };

    let mut streak = None;
    if def.difficulty == Difficulty::Easy {
        let easy_done = store
            .completed_task_codes(account_id, date)?
            .iter()
            .filter(|code| {
                definitions
                    .iter()
                    .any(|d| d.code == code.as_str() && d.difficulty == Difficulty::Easy)
            })
            .count();
        if easy_done >= streak_config.min_easy_tasks as usize {
            streak = streaks::update_in(store, streak_config, account_id, date, now)?;
        }
    }

    let completed = DailyTaskInstance {
        progress,
        completed: true,
        completed_at: Some(now),
        reward_earned: def.reward,
        ..instance
    };
    let task = DailyTask::from_instance(completed, definitions)
        .ok_or_else(|| LoyaltyError::not_found("task definition", task_code))?;

    Ok(TaskProgressUpdate {
        task,
        completed_now: true,
        credit,
        streak,
    })
}

/// Generates daily task sets and tracks their progress
pub struct DailyTaskScheduler {
    db: Arc<LoyaltyDb>,
    definitions: Arc<Vec<DailyTaskDefinition>>,
    config: DailyTaskConfig,
    streaks: StreakConfig,
    tiers: TierTable,
    seeds: Mutex<StdRng>,
}

impl DailyTaskScheduler {
    pub fn new(db: Arc<LoyaltyDb>, config: DailyTaskConfig, streaks: StreakConfig, tiers: TierTable) -> Self {
        Self::with_rng(db, config, streaks, tiers, StdRng::from_entropy())
    }

    /// Deterministic task selection
    pub fn with_seed(
        db: Arc<LoyaltyDb>,
        config: DailyTaskConfig,
        streaks: StreakConfig,
        tiers: TierTable,
        seed: u64,
    ) -> Self {
        Self::with_rng(db, config, streaks, tiers, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        db: Arc<LoyaltyDb>,
        config: DailyTaskConfig,
        streaks: StreakConfig,
        tiers: TierTable,
        rng: StdRng,
    ) -> Self {
        Self {
            db,
            definitions: Arc::new(catalog()),
            config,
            streaks,
            tiers,
            seeds: Mutex::new(rng),
        }
    }

    pub fn definitions(&self) -> &[DailyTaskDefinition] {
        &self.definitions
    }

    fn next_seed(&self) -> u64 {
        self.seeds.lock().unwrap_or_else(|e| e.into_inner()).gen()
    }

    /// Task set for the day, generated on first request
    pub async fn generate_for_date(&self, account_id: &str, date: NaiveDate) -> Result<Vec<DailyTask>> {
        let definitions = Arc::clone(&self.definitions);
        let config = self.config.clone();
        let tiers = self.tiers.clone();
        let account_id = account_id.to_string();
        // Same seed on every retry of the transaction
        let seed = self.next_seed();

        let (instances, created) = {
            let definitions = Arc::clone(&definitions);
            let account_id = account_id.clone();
            self.db
                .transact(move |conn| {
                    let mut rng = StdRng::seed_from_u64(seed);
                    generate_in(conn, &definitions, &config, &tiers, &account_id, date, &mut rng)
                })
                .await?
        };

        if created {
            debug!("Generated {} tasks for {} on {}", instances.len(), account_id, date);
        }
        Ok(to_views(instances, &definitions))
    }

    pub async fn update_progress(
        &self,
        account_id: &str,
        task_code: &str,
        increment: i64,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<TaskProgressUpdate> {
        let definitions = Arc::clone(&self.definitions);
        let streaks = self.streaks.clone();
        let account_id = account_id.to_string();
        let task_code = task_code.to_string();

        let update = self
            .db
            .transact(move |conn| {
                update_progress_in(conn, &definitions, &streaks, &account_id, &task_code, increment, date, now)
            })
            .await?;

        if update.completed_now {
            info!(
                "Task {} completed on {} (+{})",
                update.task.code, update.task.date, update.task.reward_earned
            );
        }
        Ok(update)
    }
}
