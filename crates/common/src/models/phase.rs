/// 部署阶段状态机
///
/// 阶段是封闭集合，合法转换由 `TRANSITIONS` 表决定：
///
/// requested -> allocating -> allocated -> network_config -> imaging
/// -> cluster_formation -> running
///
/// 任何非终态都可以进入 error。running 与 error 是仅有的终态。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// 部署阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Requested,
    Allocating,
    Allocated,
    NetworkConfig,
    Imaging,
    ClusterFormation,
    Running,
    Error,
}

/// 转换表: 当前阶段 -> 合法的下一阶段
const TRANSITIONS: &[(Phase, &[Phase])] = &[
    (Phase::Requested, &[Phase::Allocating, Phase::Error]),
    (Phase::Allocating, &[Phase::Allocated, Phase::Error]),
    (Phase::Allocated, &[Phase::NetworkConfig, Phase::Error]),
    (Phase::NetworkConfig, &[Phase::Imaging, Phase::Error]),
    (Phase::Imaging, &[Phase::ClusterFormation, Phase::Error]),
    (Phase::ClusterFormation, &[Phase::Running, Phase::Error]),
    (Phase::Running, &[]),
    (Phase::Error, &[]),
];

impl Phase {
    /// 线性顺序中的所有阶段（不含 error）
    pub const LINEAR: [Phase; 7] = [
        Phase::Requested,
        Phase::Allocating,
        Phase::Allocated,
        Phase::NetworkConfig,
        Phase::Imaging,
        Phase::ClusterFormation,
        Phase::Running,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Requested => "requested",
            Phase::Allocating => "allocating",
            Phase::Allocated => "allocated",
            Phase::NetworkConfig => "network_config",
            Phase::Imaging => "imaging",
            Phase::ClusterFormation => "cluster_formation",
            Phase::Running => "running",
            Phase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Running | Phase::Error)
    }

    /// 由编排器内部驱动的阶段，外部回调不能上报
    pub fn is_internal(&self) -> bool {
        matches!(self, Phase::Requested | Phase::Allocating | Phase::Allocated)
    }

    /// 在线性顺序中的位置，error 没有位置
    pub fn ordinal(&self) -> Option<usize> {
        Phase::LINEAR.iter().position(|p| p == self)
    }

    /// 当前阶段允许进入的下一阶段
    pub fn legal_next(&self) -> &'static [Phase] {
        TRANSITIONS
            .iter()
            .find(|(from, _)| from == self)
            .map(|(_, next)| *next)
            .unwrap_or(&[])
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        self.legal_next().contains(&next)
    }

    /// 线性顺序中的直接后继
    pub fn successor(&self) -> Option<Phase> {
        self.legal_next().iter().copied().find(|p| *p != Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Phase::Requested),
            "allocating" => Ok(Phase::Allocating),
            "allocated" => Ok(Phase::Allocated),
            "network_config" => Ok(Phase::NetworkConfig),
            "imaging" => Ok(Phase::Imaging),
            "cluster_formation" => Ok(Phase::ClusterFormation),
            "running" => Ok(Phase::Running),
            "error" => Ok(Phase::Error),
            other => Err(Error::Validation(format!("未知的部署阶段: {}", other))),
        }
    }
}

/// 回调上报的阶段状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Success,
    Failure,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Success => "success",
            PhaseStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "success" => Ok(PhaseStatus::Success),
            "failure" => Ok(PhaseStatus::Failure),
            other => Err(Error::Validation(format!("未知的阶段状态: {}", other))),
        }
    }
}

/// 回调被拒绝的原因
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// 节点已处于终态
    Terminal,
    /// 上报的阶段早于当前阶段
    Regressive,
    /// 上报的阶段跳过了直接后继
    Skipped,
    /// 外部回调试图上报内部阶段
    InternalPhase,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Terminal => "terminal",
            RejectReason::Regressive => "regressive",
            RejectReason::Skipped => "skipped",
            RejectReason::InternalPhase => "internal_phase",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 外部回调的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseDecision {
    /// 进入直接后继阶段
    Advance { from: Phase, to: Phase },
    /// 同一阶段的重复投递，只追加历史
    Duplicate { phase: Phase },
    /// 失败上报，进入 error
    Fail { from: Phase, failed_phase: Phase },
    /// 拒绝，不修改状态
    Reject { reason: RejectReason },
}

impl PhaseDecision {
    /// 判定后节点所处的阶段
    pub fn resulting_phase(&self, current: Phase) -> Phase {
        match self {
            PhaseDecision::Advance { to, .. } => *to,
            PhaseDecision::Fail { .. } => Phase::Error,
            PhaseDecision::Duplicate { .. } | PhaseDecision::Reject { .. } => current,
        }
    }
}

/// 判定一次外部阶段回调
///
/// 回调是至少一次投递，同一阶段的重复成功上报是幂等边界。
/// 上报 `error` 阶段等同于 failure 状态。
pub fn evaluate_callback(current: Phase, reported: Phase, status: PhaseStatus) -> PhaseDecision {
    let failed = status == PhaseStatus::Failure || reported == Phase::Error;

    if failed {
        return match current {
            // 失败回调的重复投递
            Phase::Error => PhaseDecision::Duplicate { phase: Phase::Error },
            Phase::Running => PhaseDecision::Reject { reason: RejectReason::Terminal },
            _ => PhaseDecision::Fail {
                from: current,
                failed_phase: if reported == Phase::Error { current } else { reported },
            },
        };
    }

    if reported == current {
        if reported.is_internal() {
            return PhaseDecision::Reject { reason: RejectReason::InternalPhase };
        }
        return PhaseDecision::Duplicate { phase: current };
    }

    if current.is_terminal() {
        return PhaseDecision::Reject { reason: RejectReason::Terminal };
    }

    match (reported.ordinal(), current.ordinal()) {
        (Some(r), Some(c)) if r < c => PhaseDecision::Reject { reason: RejectReason::Regressive },
        _ if reported.is_internal() => PhaseDecision::Reject { reason: RejectReason::InternalPhase },
        _ if current.can_transition_to(reported) => PhaseDecision::Advance { from: current, to: reported },
        _ => PhaseDecision::Reject { reason: RejectReason::Skipped },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_successors() {
        assert_eq!(Phase::Requested.successor(), Some(Phase::Allocating));
        assert_eq!(Phase::Allocated.successor(), Some(Phase::NetworkConfig));
        assert_eq!(Phase::ClusterFormation.successor(), Some(Phase::Running));
        assert_eq!(Phase::Running.successor(), None);
        assert_eq!(Phase::Error.successor(), None);
    }

    #[test]
    fn test_error_reachable_from_every_non_terminal() {
        for phase in Phase::LINEAR.iter().filter(|p| !p.is_terminal()) {
            assert!(phase.can_transition_to(Phase::Error), "{} -> error", phase);
        }
        assert!(!Phase::Running.can_transition_to(Phase::Error));
        assert!(!Phase::Error.can_transition_to(Phase::Requested));
    }

    #[test]
    fn test_phase_names_parse_back() {
        for phase in Phase::LINEAR.iter().chain(std::iter::once(&Phase::Error)) {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), *phase);
        }
        assert!("booting".parse::<Phase>().is_err());
    }

    #[test]
    fn test_success_for_successor_advances() {
        let decision = evaluate_callback(Phase::Allocated, Phase::NetworkConfig, PhaseStatus::Success);
        assert_eq!(
            decision,
            PhaseDecision::Advance { from: Phase::Allocated, to: Phase::NetworkConfig }
        );
        assert_eq!(decision.resulting_phase(Phase::Allocated), Phase::NetworkConfig);
    }

    #[test]
    fn test_pending_for_successor_advances() {
        let decision = evaluate_callback(Phase::NetworkConfig, Phase::Imaging, PhaseStatus::Pending);
        assert_eq!(decision, PhaseDecision::Advance { from: Phase::NetworkConfig, to: Phase::Imaging });
    }

    #[test]
    fn test_same_phase_redelivery_is_duplicate() {
        assert_eq!(
            evaluate_callback(Phase::Imaging, Phase::Imaging, PhaseStatus::Success),
            PhaseDecision::Duplicate { phase: Phase::Imaging }
        );
        assert_eq!(
            evaluate_callback(Phase::Running, Phase::Running, PhaseStatus::Success),
            PhaseDecision::Duplicate { phase: Phase::Running }
        );
    }

    #[test]
    fn test_regressive_callback_rejected() {
        assert_eq!(
            evaluate_callback(Phase::ClusterFormation, Phase::NetworkConfig, PhaseStatus::Success),
            PhaseDecision::Reject { reason: RejectReason::Regressive }
        );
        assert_eq!(
            evaluate_callback(Phase::Imaging, Phase::Allocated, PhaseStatus::Success),
            PhaseDecision::Reject { reason: RejectReason::Regressive }
        );
    }

    #[test]
    fn test_skipping_ahead_rejected() {
        assert_eq!(
            evaluate_callback(Phase::Allocated, Phase::Imaging, PhaseStatus::Success),
            PhaseDecision::Reject { reason: RejectReason::Skipped }
        );
        assert_eq!(
            evaluate_callback(Phase::Allocating, Phase::NetworkConfig, PhaseStatus::Success),
            PhaseDecision::Reject { reason: RejectReason::Skipped }
        );
    }

    #[test]
    fn test_internal_phase_cannot_be_reported() {
        assert_eq!(
            evaluate_callback(Phase::Requested, Phase::Allocating, PhaseStatus::Success),
            PhaseDecision::Reject { reason: RejectReason::InternalPhase }
        );
        assert_eq!(
            evaluate_callback(Phase::Allocated, Phase::Allocated, PhaseStatus::Success),
            PhaseDecision::Reject { reason: RejectReason::InternalPhase }
        );
    }

    #[test]
    fn test_failure_moves_to_error_from_any_non_terminal() {
        assert_eq!(
            evaluate_callback(Phase::Imaging, Phase::Imaging, PhaseStatus::Failure),
            PhaseDecision::Fail { from: Phase::Imaging, failed_phase: Phase::Imaging }
        );
        // 失败上报的阶段不必是当前阶段
        assert_eq!(
            evaluate_callback(Phase::Allocated, Phase::ClusterFormation, PhaseStatus::Failure),
            PhaseDecision::Fail { from: Phase::Allocated, failed_phase: Phase::ClusterFormation }
        );
        assert_eq!(
            evaluate_callback(Phase::NetworkConfig, Phase::Error, PhaseStatus::Success),
            PhaseDecision::Fail { from: Phase::NetworkConfig, failed_phase: Phase::NetworkConfig }
        );
    }

    #[test]
    fn test_terminal_states_accept_no_advance() {
        assert_eq!(
            evaluate_callback(Phase::Error, Phase::Running, PhaseStatus::Success),
            PhaseDecision::Reject { reason: RejectReason::Terminal }
        );
        assert_eq!(
            evaluate_callback(Phase::Running, Phase::Imaging, PhaseStatus::Failure),
            PhaseDecision::Reject { reason: RejectReason::Terminal }
        );
        assert_eq!(
            evaluate_callback(Phase::Error, Phase::Imaging, PhaseStatus::Failure),
            PhaseDecision::Duplicate { phase: Phase::Error }
        );
    }
}
