use std::sync::Arc;

use burn_ndarray::NdArray;
use burn_sharded::comm::CommBackend;
use burn_sharded::harness::{
    HarnessConfig, MultiRankHarness, RunOutcome, SkipReason, TEST_DEVICE_NUM,
};
use burn_sharded::sharding::{ChunkShardingSpec, ShardingError};
use burn_sharded::{DeviceKind, DistContext, HostDevices, Shard, ShardError, ShardedTensor};
use burn_tensor::{Tensor, TensorData};
use pretty_assertions::assert_eq;

type TestBackend = NdArray<f32>;

fn chunk_spec(device: &str) -> ChunkShardingSpec {
    ChunkShardingSpec::new(
        0,
        (0..TEST_DEVICE_NUM).map(|rank| format!("rank:{rank}/{device}:{rank}")),
    )
    .unwrap()
}

fn harness() -> MultiRankHarness<TestBackend> {
    MultiRankHarness::new(
        HarnessConfig::default(),
        Arc::new(HostDevices::new(TEST_DEVICE_NUM)),
    )
}

fn deep_copy_scenario(
    spec: &ChunkShardingSpec,
) -> impl Fn(DistContext<TestBackend>) -> Result<(), ShardError> + Sync + '_ {
    move |context: DistContext<TestBackend>| {
        let st = ShardedTensor::<TestBackend, 2>::rand(spec.clone(), [12, 5], &context)?;
        let copied_st = st.deep_copy();

        assert_eq!(
            std::any::type_name_of_val(&copied_st),
            std::any::type_name_of_val(&st)
        );
        assert_eq!(copied_st.local_tensor()?.dims(), [3, 5]);
        copied_st
            .local_tensor()?
            .to_data()
            .assert_eq(&st.local_tensor()?.to_data(), true);
        assert!(!copied_st.shares_identity(&st));
        assert!(st.clone().shares_identity(&st));
        assert_eq!(copied_st.metadata(), st.metadata());
        assert_eq!(copied_st.sharding_spec(), st.sharding_spec());

        Ok(())
    }
}

#[test]
fn test_deep_copy_on_cuda_placements_is_gated() {
    let spec = chunk_spec("cuda");

    let outcome = harness()
        .require_devices(DeviceKind::Cuda, TEST_DEVICE_NUM)
        .require_backend(CommBackend::Nccl)
        .run(deep_copy_scenario(&spec))
        .unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Skipped(SkipReason::InsufficientDevices {
            kind: DeviceKind::Cuda,
            required: TEST_DEVICE_NUM,
            available: 0
        })
    );
}

#[test]
fn test_deep_copy() {
    let spec = chunk_spec("cpu");

    let outcome = harness()
        .require_devices(DeviceKind::Cpu, TEST_DEVICE_NUM)
        .require_backend(CommBackend::Local)
        .run(deep_copy_scenario(&spec))
        .unwrap();

    assert_eq!(outcome, RunOutcome::Passed);
}

#[test]
fn test_deep_copy_is_independent_of_later_writes() {
    let spec = chunk_spec("cpu");

    let outcome = harness()
        .run(|context| {
            let mut st = ShardedTensor::<TestBackend, 2>::zeros(spec.clone(), [12, 5], &context)?;
            let copied_st = st.deep_copy();

            let ones = ShardedTensor::<TestBackend, 2>::ones(spec.clone(), [12, 5], &context)?;
            st.copy_from(&ones)?;

            copied_st
                .local_tensor()?
                .to_data()
                .assert_eq(&TensorData::from([[0f32; 5]; 3]), true);
            st.local_tensor()?
                .to_data()
                .assert_eq(&TensorData::from([[1f32; 5]; 3]), true);
            assert!(!st.equal(&copied_st)?);
            assert!(st.equal(&ones)?);

            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, RunOutcome::Passed);
}

#[test]
fn test_gather_reassembles_full_tensor() {
    let spec = chunk_spec("cpu");

    let outcome = harness()
        .run(|context| {
            let st = ShardedTensor::<TestBackend, 2>::rand_seeded(spec.clone(), [12, 5], 42, &context)?;
            let local = st.local_tensor()?.to_data();
            let rank = context.rank();

            let full = st.gather(0)?;
            match rank {
                0 => {
                    let full = full.expect("rank 0 is the destination");
                    assert_eq!(full.dims(), [12, 5]);
                    full.narrow(0, 0, 3).to_data().assert_eq(&local, true);
                }
                _ => assert!(full.is_none()),
            }

            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, RunOutcome::Passed);
}

#[test]
fn test_scatter_then_gather_round_trips() {
    let spec = chunk_spec("cpu");
    let values: Vec<f32> = (0..60).map(|value| value as f32).collect();

    let outcome = harness()
        .run(|context| {
            let device = Default::default();
            let full = (context.rank() == 2).then(|| {
                Tensor::<TestBackend, 2>::from_data(TensorData::new(values.clone(), [12, 5]), &device)
            });

            let st = ShardedTensor::<TestBackend, 2>::scatter_from(full, 2, spec.clone(), &context)?;
            let expected: Vec<f32> = values[context.rank() * 15..(context.rank() + 1) * 15].to_vec();
            st.local_tensor()?
                .to_data()
                .assert_eq(&TensorData::new(expected, [3, 5]), true);

            if let Some(gathered) = st.gather(2)? {
                gathered
                    .to_data()
                    .assert_eq(&TensorData::new(values.clone(), [12, 5]), true);
            }

            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, RunOutcome::Passed);
}

#[test]
fn test_uneven_chunks() {
    let spec = chunk_spec("cpu");

    let outcome = harness()
        .run(|context| {
            let st = ShardedTensor::<TestBackend, 2>::full(spec.clone(), [7, 2], 3.5, &context)?;
            let rows = [2, 2, 2, 1][context.rank()];

            let local = st.local_tensor()?;
            assert_eq!(local.dims(), [rows, 2]);
            local
                .to_data()
                .assert_eq(&TensorData::new(vec![3.5f32; rows * 2], [rows, 2]), true);

            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, RunOutcome::Passed);
}

#[test]
fn test_init_from_local_shards() {
    let outcome = harness()
        .run(|context| {
            let rank = context.rank();
            let device = Default::default();
            let placement = format!("rank:{rank}/cpu:{rank}").parse().unwrap();

            // Each rank owns a 2x2 block of a 4x4 tensor.
            let offsets = [(rank / 2) * 2, (rank % 2) * 2];
            let tensor = Tensor::<TestBackend, 2>::full([2, 2], rank as f32, &device);
            let shard = Shard::from_tensor_and_offsets(tensor, offsets, placement)
                .map_err(ShardError::from)?;

            let st = ShardedTensor::<TestBackend, 2>::init_from_local_shards(vec![shard], [4, 4], &context)?;
            assert_eq!(st.metadata().shards_metadata.len(), 4);
            assert_eq!(st.dims(), [4, 4]);

            if let Some(full) = st.gather(0)? {
                full.to_data().assert_eq(
                    &TensorData::from([
                        [0f32, 0., 1., 1.],
                        [0., 0., 1., 1.],
                        [2., 2., 3., 3.],
                        [2., 2., 3., 3.],
                    ]),
                    true,
                );
            }

            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, RunOutcome::Passed);
}

#[test]
fn test_init_from_local_shards_reports_overlap_on_every_rank() {
    let outcome = harness()
        .run(|context| {
            let rank = context.rank();
            let device = Default::default();
            let placement = format!("rank:{rank}/cpu").parse().unwrap();

            // Every rank claims the same rows.
            let tensor = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
            let shard = Shard::from_tensor_and_offsets(tensor, [0, 0], placement)
                .map_err(ShardError::from)?;

            let result = ShardedTensor::<TestBackend, 2>::init_from_local_shards(vec![shard], [8, 4], &context);
            assert!(matches!(
                result,
                Err(ShardError::Sharding(ShardingError::Overlap {
                    first: 0,
                    second: 1
                }))
            ));

            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, RunOutcome::Passed);
}

#[test]
fn test_local_tensor_needs_exactly_one_shard() {
    let spec = ChunkShardingSpec::new(0, ["rank:0/cpu:0", "rank:0/cpu:1", "rank:1/cpu:2"]).unwrap();
    let config = HarnessConfig::default().with_world_size(3);

    let outcome = MultiRankHarness::<TestBackend>::new(config, Arc::new(HostDevices::new(3)))
        .run(|context| {
            let st = ShardedTensor::<TestBackend, 2>::zeros(spec.clone(), [6, 2], &context)?;

            match context.rank() {
                0 => assert_eq!(
                    st.local_tensor().unwrap_err(),
                    ShardError::MultipleLocalShards { rank: 0, count: 2 }
                ),
                1 => assert_eq!(st.local_tensor()?.dims(), [2, 2]),
                _ => assert_eq!(
                    st.local_tensor().unwrap_err(),
                    ShardError::NoLocalShard { rank: 2 }
                ),
            }

            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, RunOutcome::Passed);
}

#[test]
fn test_placement_rank_outside_group() {
    let context = DistContext::<TestBackend>::single(Arc::new(HostDevices::new(4)));

    let result = ShardedTensor::<TestBackend, 2>::rand(chunk_spec("cpu"), [12, 5], &context);

    assert_eq!(
        result.unwrap_err(),
        ShardError::PlacementRankOutOfRange {
            rank: 1,
            world_size: 1
        }
    );
}

#[test]
fn test_shape_rank_must_match_tensor_rank() {
    let context = DistContext::<TestBackend>::single(Arc::new(HostDevices::new(1)));
    let spec = ChunkShardingSpec::new(0, ["rank:0/cpu"]).unwrap();

    let result = ShardedTensor::<TestBackend, 2>::zeros(spec, [12, 5, 2], &context);

    assert_eq!(
        result.unwrap_err(),
        ShardError::DimMismatch {
            expected: 2,
            actual: 3
        }
    );
}

#[test]
fn test_single_rank_deep_copy() {
    let context = DistContext::<TestBackend>::single(Arc::new(HostDevices::new(1)));
    let spec = ChunkShardingSpec::new(0, ["rank:0/cpu:0"]).unwrap();

    let st = ShardedTensor::<TestBackend, 2>::randn(spec, [4, 3], &context).unwrap();
    let copied_st = st.deep_copy();

    copied_st
        .local_tensor()
        .unwrap()
        .to_data()
        .assert_eq(&st.local_tensor().unwrap().to_data(), true);
    assert_ne!(copied_st.id(), st.id());
    assert!(copied_st.equal(&st).unwrap());
}

#[test]
fn test_trailing_empty_chunk() {
    let spec = chunk_spec("cpu");
    let values = vec![1f32, 2., 3., 4., 5., 6.];

    let outcome = harness()
        .run(|context| {
            let rank = context.rank();
            let device = Default::default();
            let full = (rank == 0).then(|| {
                Tensor::<TestBackend, 2>::from_data(TensorData::new(values.clone(), [3, 2]), &device)
            });

            let st = ShardedTensor::<TestBackend, 2>::scatter_from(full, 0, spec.clone(), &context)?;
            let shard = &st.metadata().shards_metadata[TEST_DEVICE_NUM - 1];
            assert_eq!(shard.shard_offsets, vec![3, 0]);
            assert_eq!(shard.shard_sizes, vec![0, 2]);

            let copied_st = st.deep_copy();
            let rows = if rank == TEST_DEVICE_NUM - 1 { 0 } else { 1 };
            assert_eq!(copied_st.local_tensor()?.dims(), [rows, 2]);
            assert!(copied_st.equal(&st)?);

            if let Some(gathered) = copied_st.gather(0)? {
                gathered
                    .to_data()
                    .assert_eq(&TensorData::new(values.clone(), [3, 2]), true);
            }

            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, RunOutcome::Passed);
}

#[test]
fn test_copy_from_requires_same_layout() {
    let context = DistContext::<TestBackend>::single(Arc::new(HostDevices::new(1)));
    let spec = ChunkShardingSpec::new(0, ["rank:0/cpu:0"]).unwrap();

    let mut st = ShardedTensor::<TestBackend, 2>::zeros(spec.clone(), [4, 3], &context).unwrap();
    let other = ShardedTensor::<TestBackend, 2>::ones(spec, [4, 2], &context).unwrap();

    assert_eq!(st.copy_from(&other).unwrap_err(), ShardError::MetadataMismatch);
    st.local_tensor()
        .unwrap()
        .to_data()
        .assert_eq(&TensorData::from([[0f32; 3]; 4]), true);
}

#[test]
fn test_init_from_local_shards_rejects_overflowing_offsets() {
    let context = DistContext::<TestBackend>::single(Arc::new(HostDevices::new(1)));
    let tensor = Tensor::<TestBackend, 1>::zeros([2], &Default::default());
    let shard = Shard::from_tensor_and_offsets(tensor, [usize::MAX], "rank:0/cpu".parse().unwrap())
        .unwrap();

    let result = ShardedTensor::<TestBackend, 1>::init_from_local_shards(vec![shard], [4], &context);

    assert_eq!(
        result.unwrap_err(),
        ShardError::Sharding(ShardingError::ExtentOverflow { shard: 0, dim: 0 })
    );
}
