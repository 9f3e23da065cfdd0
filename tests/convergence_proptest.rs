//! Property tests: replicas that exchanged the same operations converge,
//! whatever the edits and whatever the delivery order.

use collab_sync::crdt::{Document, Operation, StateVector};
use proptest::prelude::*;

const REPLICAS: usize = 3;

#[derive(Debug, Clone)]
enum Step {
    Insert { replica: usize, at: usize, ch: char },
    Delete { replica: usize, at: usize },
    Sync { from: usize, to: usize },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..REPLICAS, any::<usize>(), prop::char::range('a', 'z'))
            .prop_map(|(replica, at, ch)| Step::Insert { replica, at, ch }),
        2 => (0..REPLICAS, any::<usize>()).prop_map(|(replica, at)| Step::Delete { replica, at }),
        1 => (0..REPLICAS, 0..REPLICAS).prop_map(|(from, to)| Step::Sync { from, to }),
    ]
}

fn run(steps: &[Step]) -> Vec<Document> {
    let mut replicas: Vec<Document> = (1..=REPLICAS as u64).map(Document::new).collect();
    for step in steps {
        match *step {
            Step::Insert { replica, at, ch } => {
                let doc = &mut replicas[replica];
                let index = at % (doc.len() + 1);
                doc.insert(index, ch).unwrap();
            }
            Step::Delete { replica, at } => {
                let doc = &mut replicas[replica];
                if !doc.is_empty() {
                    let index = at % doc.len();
                    doc.delete(index).unwrap();
                }
            }
            Step::Sync { from, to } if from != to => {
                let diff = replicas[from].diff_since(replicas[to].state_vector());
                replicas[to].apply_update(&diff);
            }
            Step::Sync { .. } => {}
        }
    }
    replicas
}

fn sync_everyone(replicas: &mut [Document]) {
    for _ in 0..2 {
        for i in 0..replicas.len() {
            for j in 0..replicas.len() {
                if i != j {
                    let diff = replicas[i].diff_since(replicas[j].state_vector());
                    replicas[j].apply_update(&diff);
                }
            }
        }
    }
}

/// Fisher-Yates with a xorshift generator, so failures replay from the seed.
fn shuffle(operations: &mut [Operation], mut seed: u64) {
    seed |= 1;
    for i in (1..operations.len()).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let j = (seed % (i as u64 + 1)) as usize;
        operations.swap(i, j);
    }
}

proptest! {
    #[test]
    fn replicas_converge_after_full_sync(steps in prop::collection::vec(step(), 1..80)) {
        let mut replicas = run(&steps);
        sync_everyone(&mut replicas);

        let reference = replicas[0].to_string();
        for replica in &replicas {
            prop_assert_eq!(replica.to_string(), reference.clone());
            prop_assert_eq!(replica.state_vector(), replicas[0].state_vector());
            prop_assert_eq!(replica.pending_len(), 0);
        }
    }

    #[test]
    fn delivery_order_does_not_matter(
        steps in prop::collection::vec(step(), 1..60),
        seed in any::<u64>(),
    ) {
        let mut replicas = run(&steps);
        sync_everyone(&mut replicas);
        let reference = replicas[0].to_string();

        let mut operations = replicas[0].operations().to_vec();
        shuffle(&mut operations, seed);

        let mut late_joiner = Document::new(99);
        for operation in operations {
            late_joiner.apply_operation(operation);
        }
        prop_assert_eq!(late_joiner.pending_len(), 0);
        prop_assert_eq!(late_joiner.to_string(), reference);
    }

    #[test]
    fn reapplying_updates_is_a_noop(steps in prop::collection::vec(step(), 1..40)) {
        let replicas = run(&steps);
        let full = replicas[0].diff_since(&StateVector::new());

        let mut copy = Document::new(42);
        copy.apply_update(&full);
        let before = copy.to_string();
        let report = copy.apply_update(&full);

        prop_assert!(!report.changed());
        prop_assert_eq!(report.duplicates, full.len());
        prop_assert_eq!(copy.to_string(), before);
    }
}
