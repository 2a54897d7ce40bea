// Completion-driven schedules: parked by the pipeline, re-armed by the reactor.

mod common;

use cadence_scheduler::{
    CompletionHook, CompletionOutcome, CompletionReactor, RecurrencePattern, SchedulerError, SeriesEnd,
    TaskStatus,
};
use chrono::{TimeZone, Utc};
use common::{at, new_schedule, Harness};

fn regenerate(months_after: u32) -> RecurrencePattern {
    RecurrencePattern::RegenerateAfterCompletion { months_after }
}

fn reactor(h: &Harness) -> CompletionReactor {
    CompletionReactor::new(h.store.clone(), h.clock.clone())
}

#[tokio::test]
async fn waits_for_completion_instead_of_advancing() {
    let h = Harness::new(at(2024, 1, 10));
    let s = h.add(new_schedule("replace filter", regenerate(1), at(2024, 1, 10)));
    let pipeline = h.pipeline();

    let r = pipeline.run_once(at(2024, 1, 10)).await.unwrap();
    assert_eq!((r.materialized, r.retired), (1, 0));

    let parked = h.reload(&s.id);
    assert_eq!(parked.cursor, at(2024, 1, 10));
    assert_eq!(parked.occurrence_count, 1);
    assert!(parked.active);
    assert!(parked.awaiting_completion);

    // time passes, nothing is completed: no second instance
    for day in 11..=31 {
        pipeline.run_once(at(2024, 1, day)).await.unwrap();
    }
    assert_eq!(h.instances(&s.id).len(), 1);
    assert_eq!(h.reload(&s.id).occurrence_count, 1);
}

#[tokio::test]
async fn completion_rearms_one_interval_after_completion_time() {
    let h = Harness::new(at(2024, 1, 10));
    let s = h.add(new_schedule("replace filter", regenerate(1), at(2024, 1, 10)));
    h.pipeline().run_once(at(2024, 1, 10)).await.unwrap();
    let instance = h.instances(&s.id).remove(0);

    let completed_at = Utc.with_ymd_and_hms(2024, 1, 20, 15, 30, 0).unwrap();
    let outcome = reactor(&h).on_instance_completed(&instance, completed_at).await.unwrap();

    let expected = Utc.with_ymd_and_hms(2024, 2, 20, 15, 30, 0).unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Rearmed {
            schedule_id: s.id.clone(),
            cursor: expected,
        }
    );
    let rearmed = h.reload(&s.id);
    assert_eq!(rearmed.cursor, expected);
    assert!(!rearmed.awaiting_completion);
    assert_eq!(rearmed.occurrence_count, 1);
}

#[tokio::test]
async fn duplicate_completion_is_ignored() {
    let h = Harness::new(at(2024, 1, 10));
    let s = h.add(new_schedule("x", regenerate(2), at(2024, 1, 10)));
    h.pipeline().run_once(at(2024, 1, 10)).await.unwrap();
    let instance = h.instances(&s.id).remove(0);
    let reactor = reactor(&h);

    let first = reactor.on_instance_completed(&instance, at(2024, 1, 15)).await.unwrap();
    assert!(matches!(first, CompletionOutcome::Rearmed { .. }));
    let second = reactor.on_instance_completed(&instance, at(2024, 1, 16)).await.unwrap();
    assert!(matches!(second, CompletionOutcome::Ignored { .. }));
    assert_eq!(h.reload(&s.id).cursor, at(2024, 3, 15));
}

#[tokio::test]
async fn backdated_completion_never_moves_cursor_backwards() {
    let h = Harness::new(at(2024, 5, 1));
    let s = h.add(new_schedule("x", regenerate(1), at(2024, 5, 1)));
    h.pipeline().run_once(at(2024, 5, 1)).await.unwrap();
    let instance = h.instances(&s.id).remove(0);

    reactor(&h).on_instance_completed(&instance, at(2024, 3, 1)).await.unwrap();
    let s = h.reload(&s.id);
    assert_eq!(s.cursor, at(2024, 6, 1));
    assert!(!s.awaiting_completion);

    // the next occurrence is a new one, not a replay of May
    h.pipeline().run_once(at(2024, 6, 1)).await.unwrap();
    assert_eq!(h.instances(&s.id).len(), 2);
}

#[tokio::test]
async fn calendar_schedules_ignore_completions() {
    let h = Harness::new(at(2024, 1, 1));
    let s = h.add(new_schedule(
        "x",
        RecurrencePattern::Daily {
            interval: 1,
            end: SeriesEnd::Never,
        },
        at(2024, 1, 1),
    ));
    h.pipeline().run_once(at(2024, 1, 1)).await.unwrap();
    let instance = h.instances(&s.id).remove(0);

    let outcome = reactor(&h).on_instance_completed(&instance, at(2024, 1, 1)).await.unwrap();
    assert!(matches!(outcome, CompletionOutcome::Ignored { .. }));
    assert_eq!(h.reload(&s.id).cursor, at(2024, 1, 2));
}

#[tokio::test]
async fn full_cycle_through_the_completion_hook() {
    let h = Harness::new(at(2024, 1, 10));
    let s = h.add(new_schedule("service boiler", regenerate(1), at(2024, 1, 10)));
    let pipeline = h.pipeline();
    let hook = CompletionHook::new(h.sink.clone(), reactor(&h));

    pipeline.run_once(at(2024, 1, 10)).await.unwrap();
    let first = h.instances(&s.id).remove(0);
    let first_id = first.id.clone().unwrap();

    // non-completing transitions leave the schedule alone
    let (updated, outcome) = hook.transition(&first_id, TaskStatus::Active, at(2024, 1, 11)).await.unwrap();
    assert_eq!(updated.status, TaskStatus::Active);
    assert!(outcome.is_none());
    assert!(h.reload(&s.id).awaiting_completion);

    let (_, outcome) = hook.transition(&first_id, TaskStatus::Complete, at(2024, 1, 12)).await.unwrap();
    assert!(matches!(outcome, Some(CompletionOutcome::Rearmed { .. })));
    assert_eq!(h.reload(&s.id).cursor, at(2024, 2, 12));

    // completing again is a no-op
    let (_, outcome) = hook.transition(&first_id, TaskStatus::Complete, at(2024, 1, 13)).await.unwrap();
    assert!(outcome.is_none());

    assert_eq!(pipeline.run_once(at(2024, 2, 11)).await.unwrap().materialized, 0);
    assert_eq!(pipeline.run_once(at(2024, 2, 12)).await.unwrap().materialized, 1);

    let s = h.reload(&s.id);
    assert_eq!(s.occurrence_count, 2);
    assert!(s.awaiting_completion);
    let instances = h.instances(&s.id);
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[1].occurrence_date, at(2024, 2, 12));
}

#[tokio::test]
async fn hook_rejects_unknown_instance() {
    let h = Harness::new(at(2024, 1, 1));
    let hook = CompletionHook::new(h.sink.clone(), reactor(&h));
    let err = hook
        .transition("nope", TaskStatus::Complete, at(2024, 1, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InstanceNotFound { .. }));
}

#[tokio::test]
async fn switching_pattern_releases_a_parked_schedule() {
    let h = Harness::new(at(2024, 1, 10));
    let s = h.add(new_schedule("x", regenerate(1), at(2024, 1, 10)));
    h.pipeline().run_once(at(2024, 1, 10)).await.unwrap();
    assert!(h.reload(&s.id).awaiting_completion);

    let daily = RecurrencePattern::Daily {
        interval: 1,
        end: SeriesEnd::Never,
    };
    h.store.update_pattern(&s.id, &daily, at(2024, 1, 11)).unwrap();

    // the parked occurrence is left behind; the daily series starts after it
    let released = h.reload(&s.id);
    assert!(!released.awaiting_completion);
    assert_eq!(released.cursor, at(2024, 1, 11));
    assert_eq!(released.occurrence_count, 1);

    h.pipeline().run_once(at(2024, 1, 11)).await.unwrap();
    assert_eq!(h.instances(&s.id).len(), 2);
    assert_eq!(h.reload(&s.id).cursor, at(2024, 1, 12));
}

#[tokio::test]
async fn concurrent_reactors_rearm_once() {
    let h = Harness::new(at(2024, 1, 10));
    let s = h.add(new_schedule("x", regenerate(1), at(2024, 1, 10)));
    h.pipeline().run_once(at(2024, 1, 10)).await.unwrap();
    let instance = h.instances(&s.id).remove(0);
    let (r1, r2) = (reactor(&h), reactor(&h));

    let (a, b) = tokio::join!(
        r1.on_instance_completed(&instance, at(2024, 1, 20)),
        r2.on_instance_completed(&instance, at(2024, 1, 21)),
    );
    let rearmed = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(|o| matches!(o, CompletionOutcome::Rearmed { .. }))
        .count();
    assert_eq!(rearmed, 1);
}
