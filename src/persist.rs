//! JSON snapshots of parameter values.

use crate::{param::Param, Error, Result};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

#[derive(Debug, Serialize, Deserialize)]
struct ParamRecord {
    name: String,
    shape: Vec<usize>,
    values: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    params: Vec<ParamRecord>,
}

/// Writes `{"params": [{"name", "shape", "values"}, ...]}` in `params` order.
pub fn save_params<W: Write>(params: &[Param], writer: W) -> Result<()> {
    let snapshot = Snapshot {
        params: params
            .iter()
            .map(|p| ParamRecord {
                name: p.name().to_string(),
                shape: p.shape().to_vec(),
                values: p.read().iter().copied().collect(),
            })
            .collect(),
    };
    serde_json::to_writer(writer, &snapshot)?;
    Ok(())
}

/// Reads a snapshot and writes every value into the parameter of the same
/// name. Every record is checked before the first write.
pub fn load_params<R: Read>(params: &[Param], reader: R) -> Result<()> {
    let snapshot: Snapshot = serde_json::from_reader(reader)?;

    let mut values = Vec::with_capacity(params.len());
    for param in params {
        let mut matching = snapshot.params.iter().filter(|r| r.name == param.name());
        let record = matching
            .next()
            .ok_or_else(|| Error::Snapshot(format!("no value for `{}`", param.name())))?;
        if matching.next().is_some() {
            return Err(Error::Snapshot(format!(
                "`{}` appears more than once",
                param.name()
            )));
        }

        param.check_shape(&record.shape)?;
        let value = ArrayD::from_shape_vec(IxDyn(&record.shape), record.values.clone())
            .map_err(|e| Error::Snapshot(format!("`{}`: {}", param.name(), e)))?;
        values.push(value);
    }

    if let Some(extra) = snapshot
        .params
        .iter()
        .find(|r| !params.iter().any(|p| p.name() == r.name))
    {
        return Err(Error::Snapshot(format!(
            "`{}` does not belong to this network",
            extra.name
        )));
    }

    let mut guards: Vec<_> = params.iter().map(Param::write).collect();
    for (guard, value) in guards.iter_mut().zip(values) {
        **guard = value;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamRole;
    use ndarray::array;

    fn params() -> Vec<Param> {
        vec![
            Param::new("fc.w", ParamRole::Trainable, array![[1.0, 2.0]].into_dyn()),
            Param::new("fc.running_mean", ParamRole::Auxiliary, array![3.0].into_dyn()),
        ]
    }

    #[test]
    fn test_round_trip() {
        let source = params();
        let mut buf = Vec::new();
        save_params(&source, &mut buf).unwrap();

        let target = vec![
            Param::zeros("fc.w", ParamRole::Trainable, &[1, 2]),
            Param::zeros("fc.running_mean", ParamRole::Auxiliary, &[1]),
        ];
        load_params(&target, buf.as_slice()).unwrap();
        assert_eq!(target[0].value(), source[0].value());
        assert_eq!(target[1].value(), source[1].value());
    }

    #[test]
    fn test_bad_snapshot_writes_nothing() {
        let target = params();
        let json = r#"{"params": [
            {"name": "fc.w", "shape": [1, 2], "values": [9.0, 9.0]},
            {"name": "fc.running_mean", "shape": [2], "values": [9.0, 9.0]}
        ]}"#;

        assert!(load_params(&target, json.as_bytes()).is_err());
        assert_eq!(target[0].value(), array![[1.0, 2.0]].into_dyn());
    }

    #[test]
    fn test_missing_param() {
        let json = r#"{"params": [{"name": "fc.w", "shape": [1, 2], "values": [0.0, 0.0]}]}"#;
        let err = load_params(&params(), json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("fc.running_mean"));
    }
}
