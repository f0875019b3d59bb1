//! 失败通知策略
//!
//! 将动词结果映射为至多一条面向用户的通知：成功与取消不通知，其余失败恰好一条。

use serde::Serialize;

use crate::core::state::Verb;
use crate::core::ErrorKind;

/// 面向用户的失败通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub verb: Verb,
    pub title: String,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct NoticePolicy;

impl NoticePolicy {
    /// 单个应用的动词结果
    pub fn for_verb<T>(verb: Verb, app_name: &str, result: &Result<T, ErrorKind>) -> Option<Notice> {
        match result {
            Ok(_) => None,
            Err(e) if e.is_silent() => None,
            Err(e) => Some(Notice {
                verb,
                title: format!("Failed to {} {}.", verb, app_name),
                detail: e.to_string(),
            }),
        }
    }

    /// 批量结果（如刷新全部）：忽略取消，聚合为一条通知
    pub fn for_batch<'a, T: 'a>(
        verb: Verb,
        results: impl IntoIterator<Item = (&'a str, &'a Result<T, ErrorKind>)>,
    ) -> Option<Notice> {
        let results: Vec<(&str, &Result<T, ErrorKind>)> = results.into_iter().collect();
        if let [(name, result)] = results.as_slice() {
            return Self::for_verb(verb, name, *result);
        }

        let failures: Vec<&ErrorKind> = results
            .iter()
            .filter_map(|(_, r)| r.as_ref().err())
            .filter(|e| !e.is_silent())
            .collect();
        let first = failures.first()?;
        let title = match failures.len() {
            1 => format!("Failed to {} 1 app.", verb),
            n => format!("Failed to {} {} apps.", verb, n),
        };
        Some(Notice {
            verb,
            title,
            detail: first.to_string(),
        })
    }
}
