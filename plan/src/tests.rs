// Crate-level integration tests exercising `Plan`, `Transaction`, and
// `Context` together, as opposed to the per-module unit tests living
// alongside each file.

use crate::task::TaskModel;
use crate::transaction::{EventRef, Transaction};
use crate::{Context, Plan};

fn task_model() -> std::rc::Rc<TaskModel> {
    let mut model = TaskModel::new("Job");
    model.declare_event("start", true, false);
    model.declare_event("success", false, true);
    model.declare_event("stop", true, true);
    std::rc::Rc::new(model)
}

#[test]
fn context_merge_collapses_duplicate_emissions() {
    let merged = Context::merge(vec![Context::Int(42), Context::Int(42)]);
    assert_eq!(
        merged,
        Context::List(vec![Context::Int(42), Context::Int(42)])
    );
    assert_eq!(Context::merge(vec![Context::Int(1)]), Context::Int(1));
    assert_eq!(Context::merge(vec![]), Context::None);
}

#[test]
fn arena_round_trip_preserves_ids_across_removal() {
    let mut plan = Plan::new();
    let a = plan.add_task(task_model());
    let b = plan.add_task(task_model());
    plan.remove_task(a);
    assert!(plan.tasks.get(a.0).is_none());
    assert!(plan.tasks.get(b.0).is_some());
}

#[test]
fn transaction_adds_a_task_that_signals_an_existing_one() {
    let mut plan = Plan::new();
    let existing = plan.add_task(task_model());
    let existing_start = plan.tasks.get(existing.0).unwrap().event_id("start").unwrap();

    let mut trsc = Transaction::new();
    let new_task = trsc.add_task(task_model());
    let new_success = trsc.new_task_event(new_task, "success").unwrap();
    trsc.link_signal(new_success, EventRef::Plan(existing_start), Default::default());

    trsc.commit(&mut plan).unwrap();

    assert_eq!(plan.tasks.len(), 2);
    let new_real = plan
        .tasks
        .iter()
        .find(|(id, _)| *id != existing.0)
        .map(|(id, _)| id)
        .unwrap();
    let new_real_success = plan.tasks.get(new_real).unwrap().event_id("success").unwrap();
    assert!(plan.signal.linked(new_real_success, existing_start));
}
