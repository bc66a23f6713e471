//! Feed dispatcher: the single consumer of the hub's command inbox. Pops
//! one command at a time, resolves it against the tank registry and
//! recipe store, runs the dispensing engine to completion, records the
//! outcome, and publishes it.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::components::dispenser::engine::{DispensingContext, DispensingEngine, Ingredient as EngineIngredient, WeightSource};
use crate::components::dispenser::recipes::RecipeStore;
use crate::components::dispenser::registry::TankRegistry;
use crate::devices::hardware::pwm::PwmDriver;
use crate::error::Error;
use crate::messages::control::command::FeedCommandKind;
use crate::messages::control::event::Event;
use crate::state::{DeviceStateHub, FeedingStatus};

const INBOX_POLL: Duration = Duration::from_millis(50);

/// Runs the dispatcher loop forever, the function `feederd` spawns as the
/// dispatch task. Holds the registry behind a shared lock rather than by
/// exclusive reference, so the periodic bus-reconciliation task can take
/// its own brief lock between feeds instead of being shut out for the
/// dispatcher's entire lifetime.
pub async fn run<T, P, W>(
    hub: &DeviceStateHub,
    registry: &Arc<Mutex<TankRegistry<T, P>>>,
    scale: &W,
    engine: &DispensingEngine,
    recipe_store: &RecipeStore,
) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    P: PwmDriver,
    W: WeightSource,
{
    loop {
        let Some(command) = hub.take_command().await? else {
            sleep(INBOX_POLL).await;
            continue;
        };

        if !command.is_stop() && hub.snapshot().await?.safety_mode_engaged {
            warn!("dropping queued feed command: safety mode is engaged");
            hub.publish(Event::Error {
                code: "safety_latched".into(),
                message: "feed command dropped, safety mode is engaged".into(),
            });
            continue;
        }

        match command.kind {
            FeedCommandKind::None => {}
            FeedCommandKind::EmergencyStop => {
                let _ = registry.lock().await.stop_all_servos().await;
                hub.set_feeding_status(FeedingStatus::Idle).await?;
            }
            FeedCommandKind::TareScale => {
                if let Err(e) = scale.tare().await {
                    error!("tare failed: {e}");
                    hub.publish(Event::Error { code: "tare_failed".into(), message: e.to_string() });
                }
            }
            FeedCommandKind::Immediate { tank_uid, grams } => {
                run_feed(hub, registry, scale, engine, DispensingContext::immediate(tank_uid, grams), None).await?;
            }
            FeedCommandKind::Recipe { recipe_uid, servings } => {
                let recipes = recipe_store.load().unwrap_or_default();
                let Some(recipe) = recipes.iter().find(|r| r.uid == recipe_uid) else {
                    error!("dropping feed command: unknown recipe {recipe_uid}");
                    hub.publish(Event::Error {
                        code: "unknown_recipe".into(),
                        message: format!("recipe {recipe_uid} not found"),
                    });
                    continue;
                };
                if !recipe.enabled {
                    warn!("dropping feed command: recipe {recipe_uid} is disabled");
                    continue;
                }
                let scale_factor = servings as f32 / recipe.servings.max(1) as f32;
                let total_target_g = recipe.daily_weight_g * scale_factor;
                let ingredients = recipe
                    .ingredients
                    .iter()
                    .map(|i| EngineIngredient { tank_uid: i.tank_uid, percentage: i.percentage })
                    .collect();
                let ctx = DispensingContext::recipe(recipe_uid, ingredients, total_target_g, servings);
                run_feed(hub, registry, scale, engine, ctx, Some((recipe_uid, recipe_store))).await?;
            }
        }
    }
}

async fn run_feed<T, P, W>(
    hub: &DeviceStateHub,
    registry: &Arc<Mutex<TankRegistry<T, P>>>,
    scale: &W,
    engine: &DispensingEngine,
    ctx: DispensingContext,
    used_recipe: Option<(u32, &RecipeStore)>,
) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    P: PwmDriver,
    W: WeightSource,
{
    info!("dispatching feed: {:.1}g across {} ingredient(s)", ctx.total_target_g, ctx.ingredients.len());
    hub.set_feeding_status(FeedingStatus::Processing).await?;

    let ingredients = ctx.ingredients.clone();
    let initial_target_g: Vec<f32> = ctx.per_ingredient_remaining_g.clone();
    let result = {
        let guard = registry.lock().await;
        engine.run(&*guard, scale, hub, ctx).await
    };

    for (i, ingredient) in ingredients.iter().enumerate() {
        let dispensed = initial_target_g[i] - result.per_ingredient_remaining_g[i];
        if dispensed <= 0.0 {
            continue;
        }
        let mut guard = registry.lock().await;
        let known = guard.known_tanks().iter().find(|t| t.uid == ingredient.tank_uid);
        let Some(remaining_before) = known.map(|t| t.remaining_weight_g) else { continue };
        let new_remaining = (remaining_before - dispensed).max(0.0);
        if let Err(e) = guard.update_remaining_grams(ingredient.tank_uid, new_remaining).await {
            warn!("failed to record remaining grams for tank {:#018x}: {e}", ingredient.tank_uid);
        }
    }

    let success = matches!(result.phase, crate::components::dispenser::engine::DispensingPhase::Complete);
    if let Some((recipe_uid, store)) = used_recipe {
        if success {
            if let Ok(mut recipes) = store.load() {
                if let Some(recipe) = recipes.iter_mut().find(|r| r.uid == recipe_uid) {
                    recipe.last_used = chrono::Utc::now().timestamp();
                    let _ = store.save(&recipes);
                }
            }
        }
    }

    if let Some(reason) = &result.error {
        error!("feed failed: {reason}");
        hub.set_last_event(reason.clone()).await?;
    }
    hub.set_feeding_status(if success { FeedingStatus::Idle } else { FeedingStatus::Error }).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::dispenser::recipes::{Ingredient, Recipe};

    fn sample_recipe() -> Recipe {
        Recipe {
            uid: 7,
            name: "morning-mix".into(),
            daily_weight_g: 100.0,
            servings: 2,
            created: 0,
            last_used: 0,
            enabled: true,
            ingredients: vec![
                Ingredient { tank_uid: 1, percentage: 70.0 },
                Ingredient { tank_uid: 2, percentage: 30.0 },
            ],
        }
    }

    #[test]
    fn recipe_scale_factor_scales_the_daily_weight_by_requested_servings() {
        let recipe = sample_recipe();
        let scale_factor = 1.0_f32 / recipe.servings as f32;
        assert!((recipe.daily_weight_g * scale_factor - 50.0).abs() < 1e-6);
    }
}
