//! Pipeline planning.
//!
//! `plan` is a pure function of the notification's facts and the feature
//! toggles. It never touches storage, so the same input always yields the
//! same stage list.

use relay_common::config::AppConfig;
use relay_common::types::{
    ChannelType, CommunicationItem, IdentifierType, KeyType, SenderRateLimit,
};

use crate::queue::QueueName;
use crate::stage::{DispatchMode, PermissionCheck, PlannedStage, Stage};

/// Feature toggles that shape the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlannerConfig {
    pub combine_contact_and_permission_lookup: bool,
    pub check_communication_permissions: bool,
    pub apply_sender_rate_limit: bool,
    pub notify_onsite: bool,
}

impl From<&AppConfig> for PlannerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            combine_contact_and_permission_lookup: config.combine_contact_and_permission_lookup,
            check_communication_permissions: config.check_communication_permissions,
            apply_sender_rate_limit: config.apply_sender_rate_limit,
            notify_onsite: config.notify_onsite,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanInput {
    pub channel: ChannelType,
    /// The notification already carries a deliverable address.
    pub has_recipient: bool,
    /// Type of the identifier that drives branching, if any.
    pub identifier_type: Option<IdentifierType>,
    pub communication_item: Option<CommunicationItem>,
    pub sender_rate_limit: Option<SenderRateLimit>,
    pub key_type: KeyType,
    pub research_mode: bool,
    pub simulated_recipient: bool,
    pub override_queue: Option<QueueName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
    pub stages: Vec<PlannedStage>,
    pub dispatch_queue: QueueName,
}

impl PipelinePlan {
    pub fn stage_list(&self) -> Vec<&Stage> {
        self.stages.iter().map(|planned| &planned.stage).collect()
    }
}

pub fn plan(config: &PlannerConfig, input: &PlanInput) -> PipelinePlan {
    let dispatch_queue = dispatch_queue(input);

    let permission_check = match (&input.communication_item, input.identifier_type) {
        (Some(item), Some(_))
            if config.check_communication_permissions && !item.permission_key.is_empty() =>
        {
            Some(PermissionCheck {
                communication_item_id: item.id,
                permission_key: item.permission_key.clone(),
                default_allow: item.default_allow,
            })
        }
        _ => None,
    };

    let needs_lookup = !input.has_recipient;
    let combine = config.combine_contact_and_permission_lookup && needs_lookup;

    let mut stages = Vec::new();

    if let Some(id_type) = input.identifier_type {
        if id_type.requires_indirection() && (needs_lookup || permission_check.is_some()) {
            stages.push(PlannedStage {
                stage: Stage::ResolveIdentifierToInternalProfile,
                queue: QueueName::LookupProfileId,
            });
        }

        if config.notify_onsite && id_type.supports_onsite() {
            stages.push(PlannedStage {
                stage: Stage::NotifyOnsiteChannel,
                queue: QueueName::OnsiteNotifications,
            });
        }
    }

    if needs_lookup {
        stages.push(PlannedStage {
            stage: Stage::LookupContactInfo {
                permission: permission_check.clone().filter(|_| combine),
            },
            queue: QueueName::LookupContactInfo,
        });
    }

    if let Some(check) = permission_check.filter(|_| !combine) {
        stages.push(PlannedStage {
            stage: Stage::CheckCommunicationPermission { check },
            queue: QueueName::CommunicationPermissions,
        });
    }

    let mode = match &input.sender_rate_limit {
        Some(limit)
            if config.apply_sender_rate_limit
                && input.channel == ChannelType::Sms
                && limit.is_enabled() =>
        {
            DispatchMode::RateLimited {
                sender_id: limit.sender_id,
            }
        }
        _ => DispatchMode::Direct,
    };
    stages.push(PlannedStage {
        stage: Stage::DispatchToProvider { mode },
        queue: dispatch_queue,
    });

    PipelinePlan {
        stages,
        dispatch_queue,
    }
}

fn dispatch_queue(input: &PlanInput) -> QueueName {
    if input.research_mode || input.simulated_recipient || input.key_type == KeyType::Test {
        return QueueName::ResearchMode;
    }
    if let Some(queue) = input.override_queue {
        return queue;
    }
    match input.channel {
        ChannelType::Sms => QueueName::SendSms,
        ChannelType::Email => QueueName::SendEmail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn all_toggles() -> PlannerConfig {
        PlannerConfig {
            combine_contact_and_permission_lookup: false,
            check_communication_permissions: true,
            apply_sender_rate_limit: true,
            notify_onsite: true,
        }
    }

    fn input(channel: ChannelType) -> PlanInput {
        PlanInput {
            channel,
            has_recipient: false,
            identifier_type: None,
            communication_item: None,
            sender_rate_limit: None,
            key_type: KeyType::Normal,
            research_mode: false,
            simulated_recipient: false,
            override_queue: None,
        }
    }

    fn item() -> CommunicationItem {
        CommunicationItem {
            id: Uuid::new_v4(),
            name: "Appointment reminders".to_string(),
            permission_key: "appointment_reminders".to_string(),
            default_allow: false,
        }
    }

    fn rate_limit() -> SenderRateLimit {
        SenderRateLimit {
            sender_id: Uuid::new_v4(),
            rate_limit: 3,
            rate_limit_interval_secs: 1,
        }
    }

    #[test]
    fn test_full_sms_pipeline() {
        let limit = rate_limit();
        let item = item();
        let plan = plan(
            &all_toggles(),
            &PlanInput {
                identifier_type: Some(IdentifierType::Icn),
                communication_item: Some(item.clone()),
                sender_rate_limit: Some(limit.clone()),
                ..input(ChannelType::Sms)
            },
        );

        assert_eq!(
            plan.stage_list(),
            vec![
                &Stage::ResolveIdentifierToInternalProfile,
                &Stage::NotifyOnsiteChannel,
                &Stage::LookupContactInfo { permission: None },
                &Stage::CheckCommunicationPermission {
                    check: PermissionCheck {
                        communication_item_id: item.id,
                        permission_key: item.permission_key.clone(),
                        default_allow: false,
                    }
                },
                &Stage::DispatchToProvider {
                    mode: DispatchMode::RateLimited {
                        sender_id: limit.sender_id
                    }
                },
            ]
        );
        let queues: Vec<_> = plan.stages.iter().map(|s| s.queue).collect();
        assert_eq!(
            queues,
            vec![
                QueueName::LookupProfileId,
                QueueName::OnsiteNotifications,
                QueueName::LookupContactInfo,
                QueueName::CommunicationPermissions,
                QueueName::SendSms,
            ]
        );
        assert_eq!(plan.dispatch_queue, QueueName::SendSms);
    }

    #[test]
    fn test_email_with_address_no_toggles() {
        let plan = plan(
            &PlannerConfig::default(),
            &PlanInput {
                has_recipient: true,
                ..input(ChannelType::Email)
            },
        );
        assert_eq!(
            plan.stage_list(),
            vec![&Stage::DispatchToProvider {
                mode: DispatchMode::Direct
            }]
        );
        assert_eq!(plan.dispatch_queue, QueueName::SendEmail);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let config = all_toggles();
        let input = PlanInput {
            identifier_type: Some(IdentifierType::Edipi),
            communication_item: Some(item()),
            sender_rate_limit: Some(rate_limit()),
            ..input(ChannelType::Sms)
        };
        let first = plan(&config, &input);
        for _ in 0..10 {
            assert_eq!(plan(&config, &input), first);
        }
    }

    #[test]
    fn test_combined_lookup_carries_permission() {
        let config = PlannerConfig {
            combine_contact_and_permission_lookup: true,
            ..all_toggles()
        };
        let item = item();
        let plan = plan(
            &config,
            &PlanInput {
                identifier_type: Some(IdentifierType::ProfileId),
                communication_item: Some(item.clone()),
                ..input(ChannelType::Email)
            },
        );
        assert_eq!(
            plan.stage_list(),
            vec![
                &Stage::LookupContactInfo {
                    permission: Some(PermissionCheck {
                        communication_item_id: item.id,
                        permission_key: item.permission_key.clone(),
                        default_allow: false,
                    })
                },
                &Stage::DispatchToProvider {
                    mode: DispatchMode::Direct
                },
            ]
        );
    }

    #[test]
    fn test_combined_toggle_with_address_runs_separate_check() {
        let config = PlannerConfig {
            combine_contact_and_permission_lookup: true,
            ..all_toggles()
        };
        let plan = plan(
            &config,
            &PlanInput {
                has_recipient: true,
                identifier_type: Some(IdentifierType::Icn),
                communication_item: Some(item()),
                ..input(ChannelType::Email)
            },
        );
        let kinds: Vec<_> = plan.stages.iter().map(|s| s.stage.kind()).collect();
        use crate::stage::StageKind::*;
        assert_eq!(kinds, vec![ResolveProfile, NotifyOnsite, CheckPermission, Dispatch]);
    }

    #[test]
    fn test_address_without_permission_skips_resolution() {
        let plan = plan(
            &all_toggles(),
            &PlanInput {
                has_recipient: true,
                identifier_type: Some(IdentifierType::Edipi),
                ..input(ChannelType::Sms)
            },
        );
        assert_eq!(plan.stages.len(), 1);
    }

    #[test]
    fn test_onsite_only_for_icn() {
        let plan = plan(
            &all_toggles(),
            &PlanInput {
                identifier_type: Some(IdentifierType::BirlsId),
                ..input(ChannelType::Sms)
            },
        );
        assert!(!plan.stage_list().contains(&&Stage::NotifyOnsiteChannel));
    }

    #[test]
    fn test_rate_limit_only_for_sms_when_enabled() {
        let email = plan(
            &all_toggles(),
            &PlanInput {
                has_recipient: true,
                sender_rate_limit: Some(rate_limit()),
                ..input(ChannelType::Email)
            },
        );
        assert_eq!(
            email.stages[0].stage,
            Stage::DispatchToProvider {
                mode: DispatchMode::Direct
            }
        );

        let toggled_off = plan(
            &PlannerConfig {
                apply_sender_rate_limit: false,
                ..all_toggles()
            },
            &PlanInput {
                has_recipient: true,
                sender_rate_limit: Some(rate_limit()),
                ..input(ChannelType::Sms)
            },
        );
        assert_eq!(
            toggled_off.stages[0].stage,
            Stage::DispatchToProvider {
                mode: DispatchMode::Direct
            }
        );
    }

    #[test]
    fn test_permission_toggle_off_skips_check() {
        let plan = plan(
            &PlannerConfig {
                check_communication_permissions: false,
                ..all_toggles()
            },
            &PlanInput {
                has_recipient: true,
                identifier_type: Some(IdentifierType::ProfileId),
                communication_item: Some(item()),
                ..input(ChannelType::Email)
            },
        );
        assert_eq!(plan.stages.len(), 1);
    }

    #[test]
    fn test_queue_selection() {
        let base = PlanInput {
            has_recipient: true,
            ..input(ChannelType::Sms)
        };

        let research = plan(
            &PlannerConfig::default(),
            &PlanInput {
                research_mode: true,
                override_queue: Some(QueueName::Priority),
                ..base.clone()
            },
        );
        assert_eq!(research.dispatch_queue, QueueName::ResearchMode);

        let test_key = plan(
            &PlannerConfig::default(),
            &PlanInput {
                key_type: KeyType::Test,
                ..base.clone()
            },
        );
        assert_eq!(test_key.dispatch_queue, QueueName::ResearchMode);

        let simulated = plan(
            &PlannerConfig::default(),
            &PlanInput {
                simulated_recipient: true,
                ..base.clone()
            },
        );
        assert_eq!(simulated.dispatch_queue, QueueName::ResearchMode);

        let priority = plan(
            &PlannerConfig::default(),
            &PlanInput {
                override_queue: Some(QueueName::Priority),
                ..base
            },
        );
        assert_eq!(priority.dispatch_queue, QueueName::Priority);
        assert_eq!(priority.stages[0].queue, QueueName::Priority);
    }
}
