/// Structural learning-rate grouping: the eight (block, kind) groups, their
/// documented multipliers, and the weight-decay rule.
///
/// Run: cargo test --test test_groups

use msnet_core::model::{
    decays, lr_multiplier, LrBlock, MsNetConfig, MsNetParams, ParamKind,
};
use msnet_core::optim::{GroupedSgd, SgdConfig};

#[test]
fn eight_groups_with_documented_tensor_counts() {
    let cfg = MsNetConfig::default_config();
    let params = MsNetParams::init(&cfg, 42);
    let counts = params.group_counts();
    // Stages 1-4: 2+2+3+3 convs. Stage 5: 3 convs.
    assert_eq!(counts[0], [10, 10]);
    assert_eq!(counts[1], [3, 3]);
    // 5 side projections + 4 fusion convs.
    assert_eq!(counts[2], [9, 9]);
    assert_eq!(counts[3], [1, 1]);
    let total: usize = counts.iter().flatten().sum();
    assert_eq!(total, params.tensors().len());
}

#[test]
fn multipliers_match_the_schedule() {
    assert_eq!(lr_multiplier(LrBlock::Enc14, ParamKind::Weight), 1.0);
    assert_eq!(lr_multiplier(LrBlock::Enc14, ParamKind::Bias), 2.0);
    assert_eq!(lr_multiplier(LrBlock::Enc5, ParamKind::Weight), 100.0);
    assert_eq!(lr_multiplier(LrBlock::Enc5, ParamKind::Bias), 200.0);
    assert_eq!(lr_multiplier(LrBlock::Cascade, ParamKind::Weight), 0.01);
    assert_eq!(lr_multiplier(LrBlock::Cascade, ParamKind::Bias), 0.02);
    assert_eq!(lr_multiplier(LrBlock::Fuse, ParamKind::Weight), 0.001);
    assert_eq!(lr_multiplier(LrBlock::Fuse, ParamKind::Bias), 0.002);
}

#[test]
fn bias_multiplier_doubles_the_weight_multiplier() {
    for block in [LrBlock::Enc14, LrBlock::Enc5, LrBlock::Cascade, LrBlock::Fuse] {
        let w = lr_multiplier(block, ParamKind::Weight);
        let b = lr_multiplier(block, ParamKind::Bias);
        assert!((b / w - 2.0).abs() < 1e-6, "{block:?}");
    }
}

#[test]
fn decay_applies_to_weights_only() {
    assert!(decays(ParamKind::Weight));
    assert!(!decays(ParamKind::Bias));
}

#[test]
fn fusion_convs_train_at_the_cascade_rate() {
    // A unit gradient on a fusion conv weight and a side weight must move
    // both by the same amount: they share the Cascade group.
    let cfg = MsNetConfig::test_config();
    let mut params = MsNetParams::init(&cfg, 42);
    let side_before = params.side[0].w[0];
    let fusew_before = params.fusew[0].w[0];
    let mut grads = params.zeros_like();
    grads.side[0].w[0] = 1.0;
    grads.fusew[0].w[0] = 1.0;
    let mut opt = GroupedSgd::new(
        SgdConfig {
            lr: 1.0,
            momentum: 0.0,
            weight_decay: 0.0,
            stepsize: 1,
            gamma: 1.0,
        },
        &params,
    );
    opt.step(&mut params, &grads);
    let d_side = side_before - params.side[0].w[0];
    let d_fusew = fusew_before - params.fusew[0].w[0];
    assert!((d_side - 0.01).abs() < 1e-7);
    assert!((d_fusew - 0.01).abs() < 1e-7);
}

#[test]
fn grouping_is_structural_not_positional() {
    // Widening one stage changes tensor sizes but never the group tags.
    let cfg = MsNetConfig::test_config();
    let mut wide = cfg.clone();
    wide.channels[4] = 11;
    let a = MsNetParams::init(&cfg, 1);
    let b = MsNetParams::init(&wide, 1);
    let tags_a: Vec<(LrBlock, ParamKind)> =
        a.tensors().into_iter().map(|(bl, k, _)| (bl, k)).collect();
    let tags_b: Vec<(LrBlock, ParamKind)> =
        b.tensors().into_iter().map(|(bl, k, _)| (bl, k)).collect();
    assert_eq!(tags_a, tags_b);
}
