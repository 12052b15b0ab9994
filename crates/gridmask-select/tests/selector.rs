//! Verhalten von `MaskedActionSelector::select` auf ganzen Batches.

use gridmask_core::{
    keys, ActionTree, InferenceInput, InferenceOutput, ModelCapability, ModelError, PolicyModel,
    StepInfo,
};
use gridmask_select::{
    masked_entropy, masked_log_prob, GlobalTimestep, MaskedActionSelector, SelectError,
    SelectorConfig, MASKED_LOGIT,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::sync::Arc;
use std::thread;

/// Modell, dessen Beobachtungen direkt die Score-Zeilen sind.
struct EchoModel {
    capability: ModelCapability,
}

impl PolicyModel for EchoModel {
    type Observation = Vec<f32>;

    fn capability(&self) -> ModelCapability {
        self.capability.clone()
    }

    fn forward(
        &self,
        input: &InferenceInput<'_, Vec<f32>>,
    ) -> Result<InferenceOutput, ModelError> {
        Ok(InferenceOutput {
            scores: input.observations.to_vec(),
            state_out: Vec::new(),
        })
    }
}

fn flat_selector(nvec: Vec<usize>, config: SelectorConfig) -> MaskedActionSelector<EchoModel> {
    MaskedActionSelector::new(
        config,
        EchoModel {
            capability: ModelCapability::Flat { nvec },
        },
    )
    .expect("selector")
}

fn grid_selector(width: usize, height: usize, cell_nvec: Vec<usize>) -> MaskedActionSelector<EchoModel> {
    MaskedActionSelector::new(
        SelectorConfig::masked(),
        EchoModel {
            capability: ModelCapability::SpatialGrid {
                width,
                height,
                cell_nvec,
            },
        },
    )
    .expect("selector")
}

fn tree(value: serde_json::Value) -> ActionTree {
    serde_json::from_value(value).expect("tree")
}

#[test]
fn flat_scenario_three_examples() {
    let selector = flat_selector(vec![4], SelectorConfig::masked());
    let observations = vec![
        vec![0.1, 0.9, 0.3, 0.2],
        vec![5.0, 0.4, 0.7, 9.0],
        vec![0.0, 3.0, 2.0, 1.0],
    ];
    let infos = vec![
        StepInfo::with_tree(ActionTree::from_flat([0])),
        StepInfo::with_tree(ActionTree::from_flat([1, 2])),
        StepInfo::default(),
    ];
    let mut rng = StdRng::seed_from_u64(17);

    let selection = selector
        .select(
            &InferenceInput::new(&observations),
            &infos,
            Some(false),
            None,
            &mut rng,
        )
        .expect("selection");

    assert_eq!(selection.actions, vec![vec![0], vec![2], vec![0]]);
    assert_eq!(
        selection.side_info.valid_action_mask,
        vec![vec![1, 0, 0, 0], vec![0, 1, 1, 0], vec![1, 0, 0, 0]]
    );
    assert_eq!(
        selection.side_info.action_dist_inputs[1],
        vec![MASKED_LOGIT, 0.4, 0.7, MASKED_LOGIT]
    );
    assert_eq!(selection.side_info.valid_action_trees[2], ActionTree::identity(1));
    assert!(selection.side_info.action_logp[0].abs() < 1e-6);
    assert!((selection.side_info.action_prob[0] - 1.0).abs() < 1e-6);
}

#[test]
fn one_entry_per_example() {
    let selector = flat_selector(vec![3, 2], SelectorConfig::masked());
    for batch in [0usize, 1, 5, 32] {
        let observations = vec![vec![0.5, 0.1, 0.2, 0.3, 0.4]; batch];
        let infos = vec![StepInfo::with_tree(tree(json!({"1": [0, 1], "2": [1]}))); batch];
        let mut rng = StdRng::seed_from_u64(batch as u64);

        let selection = selector
            .select(&InferenceInput::new(&observations), &infos, Some(true), None, &mut rng)
            .expect("selection");

        assert_eq!(selection.len(), batch);
        assert_eq!(selection.side_info.valid_action_mask.len(), batch);
        assert_eq!(selection.side_info.action_dist_inputs.len(), batch);
        assert_eq!(selection.side_info.action_logp.len(), batch);
        assert_eq!(selection.side_info.action_prob.len(), batch);
        assert_eq!(selection.side_info.valid_action_trees.len(), batch);
        for action in &selection.actions {
            assert!(infos[0].valid_action_tree.as_ref().is_some_and(|t| t.contains(action)));
        }
    }
}

#[test]
fn single_legal_action_is_deterministic_when_exploiting() {
    let selector = flat_selector(vec![2, 3], SelectorConfig::masked());
    let observations = vec![vec![9.0, -1.0, 4.0, 8.0, 7.0]; 4];
    let infos = vec![StepInfo::with_tree(tree(json!({"1": [0]}))); 4];

    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let selection = selector
            .select(&InferenceInput::new(&observations), &infos, Some(false), None, &mut rng)
            .expect("selection");
        assert!(selection.actions.iter().all(|a| a == &vec![1, 0]));
        assert!(selection
            .side_info
            .action_prob
            .iter()
            .all(|p| (p - 1.0).abs() < 1e-6));
    }
}

#[test]
fn missing_tree_behaves_like_explicit_default() {
    let selector = flat_selector(vec![3, 3], SelectorConfig::masked());
    let observations = vec![vec![0.3, 0.2, 0.1, 0.9, 0.8, 0.7]; 3];
    let missing = vec![StepInfo::default(); 3];
    let explicit = vec![StepInfo::with_tree(selector.default_tree().clone()); 3];

    let mut rng_a = StdRng::seed_from_u64(99);
    let mut rng_b = StdRng::seed_from_u64(99);
    let a = selector
        .select(&InferenceInput::new(&observations), &missing, Some(true), Some(0), &mut rng_a)
        .expect("selection");
    let b = selector
        .select(&InferenceInput::new(&observations), &explicit, Some(true), Some(0), &mut rng_b)
        .expect("selection");

    assert_eq!(a, b);
    assert!(a.actions.iter().all(|action| action == &vec![0, 0]));
}

#[test]
fn global_timestep_accumulates_batch_sizes() {
    let selector = flat_selector(vec![2], SelectorConfig::masked());
    let mut rng = StdRng::seed_from_u64(1);
    let sizes = [3usize, 1, 0, 7, 2];
    for &size in &sizes {
        let observations = vec![vec![0.0, 1.0]; size];
        let infos = vec![StepInfo::default(); size];
        selector
            .select(&InferenceInput::new(&observations), &infos, None, None, &mut rng)
            .expect("selection");
    }
    assert_eq!(selector.timestep().get(), sizes.iter().sum::<usize>() as u64);
}

#[test]
fn shared_timestep_counts_every_concurrent_call() {
    let counter = GlobalTimestep::default();
    let workers = 8u64;
    let calls = 50u64;
    let batch = 4usize;

    let selector = Arc::new(
        flat_selector(vec![2], SelectorConfig::masked()).with_timestep(counter.clone()),
    );
    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let selector = Arc::clone(&selector);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker);
                let observations = vec![vec![0.0, 1.0]; batch];
                let infos = vec![StepInfo::default(); batch];
                for _ in 0..calls {
                    selector
                        .select(&InferenceInput::new(&observations), &infos, None, None, &mut rng)
                        .expect("selection");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    assert_eq!(counter.get(), workers * calls * batch as u64);
}

#[test]
fn masking_disabled_always_fails() {
    let selector = flat_selector(vec![2], SelectorConfig::default());
    let mut rng = StdRng::seed_from_u64(0);

    for (obs_len, info_len) in [(0usize, 0usize), (1, 1), (3, 1), (2, 5)] {
        let observations = vec![vec![0.0, 1.0]; obs_len];
        let infos = vec![StepInfo::default(); info_len];
        let result = selector.select(&InferenceInput::new(&observations), &infos, None, None, &mut rng);
        assert!(matches!(result, Err(SelectError::MaskingDisabled)));
    }
    assert_eq!(selector.timestep().get(), 0);
}

#[test]
fn info_count_mismatch_is_fatal() {
    let selector = flat_selector(vec![2], SelectorConfig::masked());
    let observations = vec![vec![0.0, 1.0]; 3];
    let infos = vec![StepInfo::default(); 2];
    let mut rng = StdRng::seed_from_u64(0);

    let err = selector
        .select(&InferenceInput::new(&observations), &infos, None, None, &mut rng)
        .expect_err("mismatch");
    assert!(matches!(
        err,
        SelectError::BatchMismatch {
            what: "infos",
            expected: 3,
            found: 2
        }
    ));
    assert_eq!(selector.timestep().get(), 0);
}

#[test]
fn untrusted_tree_out_of_range_is_rejected() {
    let selector = flat_selector(vec![2], SelectorConfig::masked());
    let observations = vec![vec![0.0, 1.0]; 2];
    let infos = vec![
        StepInfo::default(),
        StepInfo::with_tree(ActionTree::from_flat([4])),
    ];
    let mut rng = StdRng::seed_from_u64(0);

    let err = selector
        .select(&InferenceInput::new(&observations), &infos, None, None, &mut rng)
        .expect_err("out of range");
    assert!(matches!(err, SelectError::InvalidLegality { index: 1, .. }));
}

#[test]
fn spatial_single_leaf_at_origin() {
    let selector = grid_selector(3, 2, vec![4, 3]);
    let row: Vec<f32> = (0..6 * 7).map(|i| (i % 5) as f32).collect();
    let observations = vec![row];
    let infos = vec![StepInfo::with_tree(tree(json!({"0": {"0": {"0": [0]}}})))];
    let mut rng = StdRng::seed_from_u64(4);

    let selection = selector
        .select(&InferenceInput::new(&observations), &infos, Some(true), None, &mut rng)
        .expect("selection");

    assert_eq!(selection.actions, vec![vec![0; 6 * 2]]);
    let mask = &selection.side_info.valid_action_mask[0];
    assert_eq!(mask.len(), 6 * 7);
    // Zelle (0, 0): Aktionstyp 0 (Index 0) und Aktions-ID 0 (Index 4).
    assert_eq!(mask[0], 1);
    assert_eq!(mask[4], 1);
    assert_eq!(mask.iter().map(|&m| usize::from(m)).sum::<usize>(), 2);
    assert!(selection.side_info.action_logp[0].abs() < 1e-6);
}

#[test]
fn spatial_single_dimension_mask_has_one_entry() {
    let selector = grid_selector(2, 2, vec![5]);
    let observations = vec![vec![1.0; 20]];
    let infos = vec![StepInfo::default()];
    let mut rng = StdRng::seed_from_u64(4);

    let selection = selector
        .select(&InferenceInput::new(&observations), &infos, Some(false), None, &mut rng)
        .expect("selection");

    assert_eq!(selection.actions, vec![vec![0; 4]]);
    let mut expected = vec![0u8; 20];
    expected[0] = 1;
    assert_eq!(selection.side_info.valid_action_mask[0], expected);
}

#[test]
fn spatial_cells_sample_independently() {
    // 2x2-Gitter, Zellen mit (action_type: 3, action_id: 2).
    let selector = grid_selector(2, 2, vec![3, 2]);
    let mut row = vec![0.0f32; 4 * 5];
    // Zelle (1, 1) = Index 3: bevorzugt Typ 2, dann ID 1.
    row[3 * 5 + 2] = 4.0;
    row[3 * 5 + 4] = 2.0;
    let observations = vec![row];
    let infos = vec![StepInfo::with_tree(tree(json!({
        "0": {"0": {"1": [1]}},
        "1": {"1": {"1": [0, 1], "2": [0, 1]}}
    })))];
    let mut rng = StdRng::seed_from_u64(8);

    let selection = selector
        .select(&InferenceInput::new(&observations), &infos, Some(false), None, &mut rng)
        .expect("selection");

    assert_eq!(selection.actions[0], vec![1, 1, 0, 0, 0, 0, 2, 1]);
    let mask = &selection.side_info.valid_action_mask[0];
    assert_eq!(&mask[0..5], &[0, 1, 0, 0, 1]);
    assert!(mask[5..15].iter().all(|&m| m == 0));
    assert_eq!(&mask[15..20], &[0, 1, 1, 1, 1]);
}

#[test]
fn stored_outputs_reproduce_log_probabilities() {
    let mut config = SelectorConfig::masked();
    config.explore = true;
    let selector = flat_selector(vec![3, 4], config);
    let observations: Vec<Vec<f32>> = (0..6)
        .map(|i| (0..7).map(|j| ((i * 7 + j) % 4) as f32 * 0.5).collect())
        .collect();
    let infos = vec![StepInfo::with_tree(tree(json!({"0": [1, 2, 3], "2": [0, 3]}))); 6];
    let mut rng = StdRng::seed_from_u64(23);

    let selection = selector
        .select(&InferenceInput::new(&observations), &infos, None, None, &mut rng)
        .expect("selection");
    let segments = selector.capability().segments();

    for i in 0..6 {
        let info = &selection.side_info;
        let logp = masked_log_prob(
            &info.action_dist_inputs[i],
            &info.valid_action_mask[i],
            &segments,
            &selection.actions[i],
        )
        .expect("logp");
        assert!((logp - info.action_logp[i]).abs() < 1e-5);
        let entropy = masked_entropy(&info.action_dist_inputs[i], &info.valid_action_mask[i], &segments)
            .expect("entropy");
        assert!(entropy >= 0.0);
    }
}

#[test]
fn grid_log_probabilities_survive_storage() {
    let selector = grid_selector(2, 1, vec![3, 2]);
    let observations = vec![vec![0.2, 0.1, 0.4, 0.3, 0.6, 1.0, 0.0, 0.5, 0.3, 0.9]];
    let infos = vec![StepInfo::with_tree(tree(json!({
        "0": {"0": {"0": [0, 1], "2": [1]}},
        "1": {"0": {"1": [0, 1]}}
    })))];
    let mut rng = StdRng::seed_from_u64(6);

    let selection = selector
        .select(&InferenceInput::new(&observations), &infos, Some(true), None, &mut rng)
        .expect("selection");
    let info = &selection.side_info;
    let logp = masked_log_prob(
        &info.action_dist_inputs[0],
        &info.valid_action_mask[0],
        &selector.capability().segments(),
        &selection.actions[0],
    )
    .expect("logp");
    assert!((logp - info.action_logp[0]).abs() < 1e-5);
}

#[test]
fn side_info_uses_trainer_keys() {
    let selector = flat_selector(vec![2], SelectorConfig::masked());
    let observations = vec![vec![0.0, 1.0]];
    let infos = vec![StepInfo::default()];
    let mut rng = StdRng::seed_from_u64(0);
    let selection = selector
        .select(&InferenceInput::new(&observations), &infos, None, None, &mut rng)
        .expect("selection");

    let value = serde_json::to_value(&selection.side_info).expect("serialize");
    assert_eq!(value[keys::VALID_ACTION_MASK], json!([[1, 0]]));
    assert_eq!(value[keys::VALID_ACTION_TREES], json!([[0]]));
    assert!(value[keys::ACTION_LOGP].is_array());
    assert!(value[keys::ACTION_PROB].is_array());
    assert!(value[keys::ACTION_DIST_INPUTS].is_array());
}
