use uuid::Uuid;

pub type JobId = Uuid;

/// 导出任务对外发出的四类事件
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// 统计得到的总行数，先于任何 Progress
    TotalRows(u64),
    /// 已写入的数据行数（累计）
    Progress(u64),
    Finished(String),
    Failed(String),
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Finished(_) | EventKind::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportEvent {
    pub job: JobId,
    pub kind: EventKind,
}
